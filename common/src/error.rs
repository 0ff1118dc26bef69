use thiserror::Error;

use crate::context::ContextKey;
use crate::key::Id;

/// Fallo reportado por el DHT / overlay. Lleva el motivo tal cual.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("no value stored at {location}/{domain}")]
    NotFound { location: Id, domain: Id },

    #[error("storage rejected the request: {0}")]
    Rejected(String),

    #[error("peer {0} is unavailable")]
    PeerUnavailable(String),
}

/// Errores de una invocación de etapa. Todos terminan en Aborted:
/// se loguean y la etapa no propaga.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("malformed context: {key} {reason}")]
    MalformedContext { key: ContextKey, reason: String },

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("transform failure: {0}")]
    Transform(String),

    #[error("broadcast failure: {0}")]
    Broadcast(String),

    #[error("no registered task accepts the message for stage {0}")]
    NoMatchingTask(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ChainError {
    pub fn missing(key: ContextKey) -> Self {
        ChainError::MalformedContext {
            key,
            reason: "is missing".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}
