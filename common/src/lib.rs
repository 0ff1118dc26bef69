//! Pipeline MapReduce encadenado por broadcasts sobre un DHT.
//!
//! Cada etapa (split, map, reduce, write, shutdown) es una [`Task`] que se
//! dispara al recibir un [`Context`], lee y escribe por el DHT y reenvía un
//! contexto proyectado para la etapa siguiente. No hay coordinador central.

pub mod builder;
pub mod cluster;
pub mod config;
pub mod context;
pub mod convergence;
pub mod error;
pub mod job;
pub mod key;
pub mod overlay;
pub mod peer;
pub mod registry;
pub mod stages;
pub mod storage;
pub mod task;
pub mod wordcount;

pub use builder::{GetBuilder, PutBuilder, ReplayBuffer};
pub use cluster::LocalCluster;
pub use config::PeerConfig;
pub use context::{Context, ContextKey};
pub use error::{ChainError, ConfigError, StorageError};
pub use job::{Job, JobId, JobWiring};
pub use key::{time_random_id, Id, Key, KeyPattern};
pub use overlay::{MemoryDht, MemoryOverlay};
pub use peer::PeerRuntime;
pub use registry::TaskRegistry;
pub use stages::JobOutcome;
pub use storage::{Dht, PeerAddress, PeerStorage};
pub use task::{StageOutcome, Task, Transform};
