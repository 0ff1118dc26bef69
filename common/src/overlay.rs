//! Overlay en memoria: DHT + broadcast dentro de un mismo proceso.
//!
//! Implementa el trait [`Dht`] para correr un cluster local de peers y para
//! los tests. Además hace de supervisor del replay: guarda los buffers de
//! los Gets en vuelo y, si el peer que los pidió se cae antes de propagar,
//! reenvía el broadcast original a los peers vivos (con un tope de reenvíos
//! por buffer).
//!
//! Un buffer en vuelo se identifica por (peer, fingerprint): varios Gets de
//! la misma invocación comparten una sola entrada y una caída la reenvía
//! una sola vez.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::builder::ReplayBuffer;
use crate::context::{Context, ContextKey};
use crate::error::StorageError;
use crate::key::{Id, Key};
use crate::storage::{Dht, PeerAddress};

#[derive(Debug, Clone)]
pub struct StoredValue {
    pub bytes: Vec<u8>,
    pub replication: u32,
    pub observations: u32,
}

impl StoredValue {
    /// Se observó al menos `replication` veces.
    pub fn reclaimable(&self) -> bool {
        self.observations >= self.replication
    }
}

struct PeerSlot {
    address: PeerAddress,
    inbox: mpsc::UnboundedSender<Context>,
    alive: bool,
}

struct InFlight {
    /// `OUTPUT_STORAGE_KEY` del contexto disparador.
    trigger: Option<Key>,
    buffer: ReplayBuffer,
}

#[derive(Default)]
struct Faults {
    gets: u32,
    puts: u32,
}

struct OverlayState {
    storage: DashMap<Key, StoredValue>,
    peers: DashMap<Id, PeerSlot>,
    /// (peer, fingerprint) -> buffer.
    in_flight: DashMap<(Id, Id), InFlight>,
    /// Reenvíos por fingerprint. Se borra cuando la etapa por fin propaga.
    resends: DashMap<Id, u32>,
    faults: DashMap<Id, Faults>,
    max_resends: u32,
}

impl OverlayState {
    /// Entrega a todos los peers vivos. Devuelve a cuántos llegó.
    fn deliver(&self, context: &Context) -> usize {
        let mut delivered = 0;
        for slot in self.peers.iter() {
            if !slot.alive {
                continue;
            }
            match slot.inbox.send(context.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => debug!("inbox de {} cerrado, se descarta", slot.address),
            }
        }
        delivered
    }

    fn resend(&self, buffer: &ReplayBuffer) -> bool {
        let fingerprint = buffer.fingerprint();
        let attempt = {
            let mut count = self.resends.entry(fingerprint).or_insert(0);
            if *count >= self.max_resends {
                warn!(
                    "buffer {} ya se reenvió {} veces, se abandona",
                    fingerprint.short(),
                    *count
                );
                return false;
            }
            *count += 1;
            *count
        };

        let delivered = self.deliver(&buffer.to_context());
        info!(
            "reenvío {}/{} del buffer {} a {} peers",
            attempt,
            self.max_resends,
            fingerprint.short(),
            delivered
        );
        true
    }

    fn is_alive(&self, peer: &Id) -> bool {
        self.peers.get(peer).map(|s| s.alive).unwrap_or(false)
    }

    fn take_get_fault(&self, peer: &Id) -> bool {
        match self.faults.get_mut(peer) {
            Some(mut f) if f.gets > 0 => {
                f.gets -= 1;
                true
            }
            _ => false,
        }
    }

    fn take_put_fault(&self, peer: &Id) -> bool {
        match self.faults.get_mut(peer) {
            Some(mut f) if f.puts > 0 => {
                f.puts -= 1;
                true
            }
            _ => false,
        }
    }

    /// La etapa disparada por `trigger` ya propagó: sus buffers no hacen
    /// falta y su cuenta de reenvíos tampoco.
    fn release(&self, peer: &Id, trigger: &Key) -> usize {
        let mut done = Vec::new();
        self.in_flight.retain(|(owner, fingerprint), op| {
            let propagated = owner == peer && op.trigger.as_ref() == Some(trigger);
            if propagated {
                done.push(*fingerprint);
            }
            !propagated
        });
        for fingerprint in &done {
            self.resends.remove(fingerprint);
        }
        done.len()
    }
}

/// Overlay compartido por todos los peers locales.
#[derive(Clone)]
pub struct MemoryOverlay {
    state: Arc<OverlayState>,
}

impl MemoryOverlay {
    pub fn new(max_resends: u32) -> Self {
        Self {
            state: Arc::new(OverlayState {
                storage: DashMap::new(),
                peers: DashMap::new(),
                in_flight: DashMap::new(),
                resends: DashMap::new(),
                faults: DashMap::new(),
                max_resends,
            }),
        }
    }

    /// Suma un peer nuevo. Devuelve su DHT y el inbox de broadcasts.
    pub fn join(&self) -> (MemoryDht, mpsc::UnboundedReceiver<Context>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Id::random();
        let address = format!("peer-{}", uuid::Uuid::new_v4());

        self.state.peers.insert(
            id,
            PeerSlot {
                address: address.clone(),
                inbox: tx,
                alive: true,
            },
        );
        info!("peer {} ({}) se une al overlay", id.short(), address);

        (
            MemoryDht {
                id,
                address,
                state: self.state.clone(),
            },
            rx,
        )
    }

    pub fn alive_peers(&self) -> Vec<Id> {
        self.state
            .peers
            .iter()
            .filter(|s| s.alive)
            .map(|s| *s.key())
            .collect()
    }

    /// Simula la caída de un peer: deja de recibir y sus buffers en vuelo
    /// se reenvían al resto. Devuelve cuántos buffers se reenviaron.
    pub fn crash_peer(&self, peer: Id) -> usize {
        if let Some(mut slot) = self.state.peers.get_mut(&peer) {
            slot.alive = false;
        }
        warn!("peer {} caído", peer.short());

        let ops: Vec<(Id, Id)> = self
            .state
            .in_flight
            .iter()
            .filter(|op| op.key().0 == peer)
            .map(|op| *op.key())
            .collect();

        let mut resent = 0;
        for op in ops {
            if let Some((_, in_flight)) = self.state.in_flight.remove(&op) {
                if self.state.resend(&in_flight.buffer) {
                    resent += 1;
                }
            }
        }
        resent
    }

    /// Reenvío explícito de un buffer (supervisión externa).
    /// `false` si ya se agotaron los reenvíos para ese buffer.
    pub fn resend(&self, buffer: &ReplayBuffer) -> bool {
        self.state.resend(buffer)
    }

    pub fn fail_next_gets(&self, peer: Id, n: u32) {
        self.state.faults.entry(peer).or_default().gets += n;
    }

    pub fn fail_next_puts(&self, peer: Id, n: u32) {
        self.state.faults.entry(peer).or_default().puts += n;
    }

    pub fn value(&self, key: &Key) -> Option<Vec<u8>> {
        self.state.storage.get(key).map(|v| v.bytes.clone())
    }

    pub fn replication(&self, key: &Key) -> Option<u32> {
        self.state.storage.get(key).map(|v| v.replication)
    }

    pub fn observations(&self, key: &Key) -> u32 {
        self.state
            .storage
            .get(key)
            .map(|v| v.observations)
            .unwrap_or(0)
    }

    /// Claves guardadas bajo una location, ordenadas.
    pub fn keys_at(&self, location: Id) -> Vec<Key> {
        let mut keys: Vec<Key> = self
            .state
            .storage
            .iter()
            .filter(|e| e.key().location() == location)
            .map(|e| *e.key())
            .collect();
        keys.sort();
        keys
    }

    pub fn in_flight(&self) -> usize {
        self.state.in_flight.len()
    }

    /// Fingerprints con reenvíos contados.
    pub fn tracked_resends(&self) -> usize {
        self.state.resends.len()
    }
}

/// Vista de un peer sobre el overlay.
pub struct MemoryDht {
    id: Id,
    address: PeerAddress,
    state: Arc<OverlayState>,
}

impl MemoryDht {
    fn ensure_alive(&self) -> Result<(), StorageError> {
        if self.state.is_alive(&self.id) {
            Ok(())
        } else {
            Err(StorageError::PeerUnavailable(self.address.clone()))
        }
    }
}

#[async_trait]
impl Dht for MemoryDht {
    fn peer_id(&self) -> Id {
        self.id
    }

    fn peer_address(&self) -> PeerAddress {
        self.address.clone()
    }

    async fn get(
        &self,
        location: Id,
        domain: Id,
        hints: Option<&ReplayBuffer>,
    ) -> Result<Vec<u8>, StorageError> {
        self.ensure_alive()?;
        if self.state.take_get_fault(&self.id) {
            return Err(StorageError::Rejected("injected get failure".into()));
        }

        let key = Key::storage(location, domain);
        let bytes = {
            let mut entry = self
                .state
                .storage
                .get_mut(&key)
                .ok_or(StorageError::NotFound { location, domain })?;
            entry.observations += 1;
            entry.bytes.clone()
        };

        if let Some(buffer) = hints.filter(|b| !b.is_empty()) {
            let trigger = buffer
                .to_context()
                .get_as::<Key>(&ContextKey::OutputStorageKey)
                .ok()
                .flatten();
            self.state
                .in_flight
                .entry((self.id, buffer.fingerprint()))
                .or_insert_with(|| InFlight {
                    trigger,
                    buffer: buffer.clone(),
                });
        }

        Ok(bytes)
    }

    async fn put(
        &self,
        location: Id,
        domain: Id,
        value: Vec<u8>,
        replication: u32,
    ) -> Result<(), StorageError> {
        self.ensure_alive()?;
        if self.state.take_put_fault(&self.id) {
            return Err(StorageError::Rejected("injected put failure".into()));
        }

        self.state.storage.insert(
            Key::storage(location, domain),
            StoredValue {
                bytes: value,
                replication,
                observations: 0,
            },
        );
        Ok(())
    }

    async fn broadcast(&self, seed: Id, context: Context) -> Result<(), StorageError> {
        self.ensure_alive()?;

        if let Ok(Some(read)) = context.get_as::<Key>(&ContextKey::InputStorageKey) {
            let released = self.state.release(&self.id, &read);
            if released > 0 {
                debug!("peer {} libera {} buffers en vuelo", self.id.short(), released);
            }
        }

        let delivered = self.state.deliver(&context);
        debug!(
            "broadcast seed={} desde {} llegó a {} peers",
            seed.short(),
            self.id.short(),
            delivered
        );
        Ok(())
    }

    fn release(&self, hints: &ReplayBuffer) {
        if self
            .state
            .in_flight
            .remove(&(self.id, hints.fingerprint()))
            .is_some()
        {
            debug!("peer {} suelta un buffer de una etapa abortada", self.id.short());
        }
    }
}
