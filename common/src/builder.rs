//! Builders de operaciones Get/Put.
//!
//! Un `GetBuilder` puede llevar el buffer de replay: copia autocontenida del
//! contexto que disparó la etapa. Se le pasa al DHT como `hints`; si el peer
//! muere antes de propagar, el overlay puede reenviar ese broadcast y otro
//! peer rehace la etapa desde el principio.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::context::{Context, ContextKey};
use crate::error::StorageError;
use crate::key::{Id, Key, ID_BYTES};
use crate::storage::PeerStorage;

/// Snapshot del contexto disparador como pares clave -> bytes.
/// Datos planos, sin referencias vivas: se puede persistir o reenviar.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayBuffer {
    entries: Vec<(ContextKey, Vec<u8>)>,
}

impl ReplayBuffer {
    pub fn from_context(context: &Context) -> Self {
        Self {
            entries: context
                .iter()
                .map(|(k, v)| (k.clone(), v.to_vec()))
                .collect(),
        }
    }

    /// Reconstruye el contexto original (para reenviarlo).
    pub fn to_context(&self) -> Context {
        self.entries.iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Identidad del contenido; dos buffers iguales dan el mismo id.
    pub fn fingerprint(&self) -> Id {
        let mut hasher = Sha256::new();
        for (key, value) in &self.entries {
            hasher.update(key.to_string().as_bytes());
            hasher.update((value.len() as u64).to_be_bytes());
            hasher.update(value);
        }
        let digest = hasher.finalize();
        let mut bytes = [0u8; ID_BYTES];
        bytes.copy_from_slice(&digest[..ID_BYTES]);
        Id::from_bytes(bytes)
    }
}

/// Get de un solo uso. Se crea con `PeerStorage::get`.
pub struct GetBuilder {
    storage: PeerStorage,
    location: Id,
    domain: Id,
    broadcast_input: Option<ReplayBuffer>,
}

impl GetBuilder {
    pub(crate) fn new(storage: PeerStorage, location: Id, domain: Id) -> Self {
        Self {
            storage,
            location,
            domain,
            broadcast_input: None,
        }
    }

    /// Adjunta el contexto disparador como buffer de replay.
    /// Un contexto vacío no deja buffer.
    pub fn broadcast_input(mut self, input: &Context) -> Self {
        if !input.is_empty() {
            self.broadcast_input = Some(ReplayBuffer::from_context(input));
        }
        self
    }

    pub fn replay_buffer(&self) -> Option<&ReplayBuffer> {
        self.broadcast_input.as_ref()
    }

    pub fn key(&self) -> Key {
        Key::storage(self.location, self.domain)
    }

    pub async fn start(self) -> Result<Vec<u8>, StorageError> {
        debug!(
            "get {}/{} (replay buffer: {})",
            self.location.short(),
            self.domain.short(),
            self.broadcast_input.as_ref().map(|b| b.len()).unwrap_or(0)
        );
        self.storage
            .dht()
            .get(self.location, self.domain, self.broadcast_input.as_ref())
            .await
    }
}

/// Put de un solo uso. `replication` es cuántas veces debe observarse el
/// valor antes de poder reclamarlo.
pub struct PutBuilder {
    storage: PeerStorage,
    location: Id,
    domain: Id,
    value: Vec<u8>,
    replication: u32,
}

impl PutBuilder {
    pub(crate) fn new(storage: PeerStorage, location: Id, domain: Id, value: Vec<u8>) -> Self {
        Self {
            storage,
            location,
            domain,
            value,
            replication: 1,
        }
    }

    pub fn replication(mut self, replication: u32) -> Self {
        self.replication = replication.max(1);
        self
    }

    pub fn key(&self) -> Key {
        Key::storage(self.location, self.domain)
    }

    /// Devuelve la clave escrita.
    pub async fn start(self) -> Result<Key, StorageError> {
        let key = self.key();
        debug!(
            "put {} ({} bytes, replication={})",
            key,
            self.value.len(),
            self.replication
        );
        self.storage
            .dht()
            .put(self.location, self.domain, self.value, self.replication)
            .await?;
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::MemoryOverlay;
    use std::sync::Arc;

    fn trigger() -> Context {
        let mut ctx = Context::new();
        ctx.put_as(ContextKey::JobKey, &"job".to_string()).unwrap();
        ctx.put_as(ContextKey::OutputStorageKey, &Key::from(Id::hash("split")))
            .unwrap();
        ctx
    }

    #[test]
    fn buffer_reconstruye_el_contexto() {
        let ctx = trigger();
        let buffer = ReplayBuffer::from_context(&ctx);
        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.to_context(), ctx);
    }

    #[test]
    fn buffer_es_independiente_del_contexto() {
        let mut ctx = trigger();
        let buffer = ReplayBuffer::from_context(&ctx);
        ctx.put_as(ContextKey::JobKey, &"cambiado".to_string()).unwrap();

        let restored = buffer.to_context();
        assert_eq!(restored.require::<String>(&ContextKey::JobKey).unwrap(), "job");
    }

    #[test]
    fn buffer_sobrevive_serializacion() {
        let buffer = ReplayBuffer::from_context(&trigger());
        let json = serde_json::to_vec(&buffer).unwrap();
        let back: ReplayBuffer = serde_json::from_slice(&json).unwrap();
        assert_eq!(back, buffer);
        assert_eq!(back.fingerprint(), buffer.fingerprint());
    }

    #[test]
    fn fingerprint_distingue_contenidos() {
        let a = ReplayBuffer::from_context(&trigger());
        let mut other = trigger();
        other.put_as(ContextKey::NumberOfFiles, &2usize).unwrap();
        let b = ReplayBuffer::from_context(&other);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[tokio::test]
    async fn get_sin_buffer_con_contexto_vacio() {
        let overlay = MemoryOverlay::new(1);
        let (dht, _inbox) = overlay.join();
        let storage = PeerStorage::new(Arc::new(dht));

        let builder = storage.get(Id::hash("a"), Id::hash("b")).broadcast_input(&Context::new());
        assert!(builder.replay_buffer().is_none());

        let builder = storage.get(Id::hash("a"), Id::hash("b")).broadcast_input(&trigger());
        assert_eq!(builder.replay_buffer().map(|b| b.len()), Some(2));
    }

    #[tokio::test]
    async fn put_y_get_por_builder() {
        let overlay = MemoryOverlay::new(1);
        let (dht, _inbox) = overlay.join();
        let storage = PeerStorage::new(Arc::new(dht));

        let key = storage
            .put(Id::hash("loc"), Id::hash("dom"), b"hola".to_vec())
            .replication(3)
            .start()
            .await
            .unwrap();
        assert_eq!(key, Key::storage(Id::hash("loc"), Id::hash("dom")));

        let value = storage.get_key(&key).start().await.unwrap();
        assert_eq!(value, b"hola".to_vec());
        assert_eq!(overlay.replication(&key), Some(3));
    }

    #[tokio::test]
    async fn get_de_slot_vacio_falla_con_motivo() {
        let overlay = MemoryOverlay::new(1);
        let (dht, _inbox) = overlay.join();
        let storage = PeerStorage::new(Arc::new(dht));

        let err = storage
            .get(Id::hash("nada"), Id::ZERO)
            .start()
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound { .. }));
    }
}
