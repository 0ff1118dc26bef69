//! Fachada de almacenamiento sobre el DHT.
//!
//! El DHT y el transporte de broadcast son externos: se consumen a través
//! del trait [`Dht`]. El resto del crate sólo habla con [`PeerStorage`],
//! que no reintenta nada por su cuenta; quien llama decide si un fallo
//! aborta la etapa o se recupera por replay.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::builder::{GetBuilder, PutBuilder, ReplayBuffer};
use crate::context::Context;
use crate::error::{ChainError, StorageError};
use crate::key::{Id, Key};

/// Dirección de un peer, tal como la expone el overlay.
pub type PeerAddress = String;

/// Interfaz mínima del colaborador DHT/overlay.
#[async_trait]
pub trait Dht: Send + Sync {
    fn peer_id(&self) -> Id;

    fn peer_address(&self) -> PeerAddress;

    /// `hints` es el buffer de replay de la etapa, si lo hay.
    async fn get(
        &self,
        location: Id,
        domain: Id,
        hints: Option<&ReplayBuffer>,
    ) -> Result<Vec<u8>, StorageError>;

    async fn put(
        &self,
        location: Id,
        domain: Id,
        value: Vec<u8>,
        replication: u32,
    ) -> Result<(), StorageError>;

    /// Best-effort: puede llegar a cero, uno o muchos peers.
    async fn broadcast(&self, seed: Id, context: Context) -> Result<(), StorageError>;

    /// La etapa que adjuntó `hints` abortó y este peer sigue vivo: el buffer
    /// deja de estar en vuelo.
    fn release(&self, _hints: &ReplayBuffer) {}
}

#[derive(Clone)]
pub struct PeerStorage {
    dht: Arc<dyn Dht>,
}

impl PeerStorage {
    pub fn new(dht: Arc<dyn Dht>) -> Self {
        Self { dht }
    }

    pub fn peer_id(&self) -> Id {
        self.dht.peer_id()
    }

    pub fn peer_address(&self) -> PeerAddress {
        self.dht.peer_address()
    }

    pub(crate) fn dht(&self) -> &Arc<dyn Dht> {
        &self.dht
    }

    pub fn get(&self, location: Id, domain: Id) -> GetBuilder {
        GetBuilder::new(self.clone(), location, domain)
    }

    pub fn get_key(&self, key: &Key) -> GetBuilder {
        self.get(key.location(), key.domain())
    }

    pub fn put(&self, location: Id, domain: Id, value: Vec<u8>) -> PutBuilder {
        PutBuilder::new(self.clone(), location, domain, value)
    }

    /// Envía el contexto a los peers interesados en `seed`.
    pub async fn broadcast(&self, seed: Id, context: Context) -> Result<(), ChainError> {
        debug!(
            "peer {} broadcast seed={} ({} claves)",
            self.peer_id().short(),
            seed.short(),
            context.len()
        );
        self.dht
            .broadcast(seed, context)
            .await
            .map_err(|e| ChainError::Broadcast(e.to_string()))
    }

    /// Suelta el buffer de replay de una etapa abortada.
    pub fn release(&self, trigger: &Context) {
        if !trigger.is_empty() {
            self.dht.release(&ReplayBuffer::from_context(trigger));
        }
    }

    /// Domain nuevo para una salida: hash(peer id + aleatorio), así dos
    /// ejecuciones de la misma etapa nunca pisan el mismo slot.
    pub fn fresh_domain(&self) -> Id {
        Id::hash(format!("{}_{}", self.peer_id(), rand::random::<i64>()))
    }
}
