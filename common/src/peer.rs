use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::context::{Context, ContextKey};
use crate::error::ChainError;
use crate::key::Key;
use crate::registry::TaskRegistry;
use crate::storage::PeerStorage;
use crate::task::StageOutcome;

/// Loop de un peer:
/// - recibe contextos por broadcast (inbox)
/// - busca la tarea registrada para cada uno
/// - lanza cada invocación en su propia tarea tokio, hasta
///   `max_concurrency` en paralelo, sin frenar la recepción
#[derive(Clone)]
pub struct PeerRuntime {
    registry: Arc<TaskRegistry>,
    storage: PeerStorage,
    permits: Arc<Semaphore>,
}

impl PeerRuntime {
    pub fn new(registry: Arc<TaskRegistry>, storage: PeerStorage, max_concurrency: usize) -> Self {
        Self {
            registry,
            storage,
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    pub fn storage(&self) -> &PeerStorage {
        &self.storage
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.registry
    }

    /// Consume el inbox hasta que se cierre.
    pub async fn run(self, mut inbox: mpsc::UnboundedReceiver<Context>) {
        info!(
            "peer {} escuchando ({} etapas registradas)",
            self.storage.peer_id().short(),
            self.registry.len()
        );

        while let Some(message) = inbox.recv().await {
            let _ = self.dispatch(message);
        }

        info!("peer {} sin inbox, saliendo", self.storage.peer_id().short());
    }

    /// Lanza la tarea que corresponda al mensaje. `None` si ninguna lo acepta.
    ///
    /// El handle devuelto termina con `None` si la etapa abortó o entró
    /// en pánico; ambos casos quedan logueados acá y nunca tumban el peer.
    pub fn dispatch(&self, message: Context) -> Option<JoinHandle<Option<StageOutcome>>> {
        let Some(task) = self.registry.lookup(&message) else {
            debug!(
                "peer {} ignora mensaje para {:?}",
                self.storage.peer_id().short(),
                message.get_as::<Key>(&ContextKey::NextTask).ok().flatten()
            );
            return None;
        };

        let stage = task.current_id();
        let storage = self.storage.clone();
        let permits = self.permits.clone();

        let invocation: JoinHandle<Result<StageOutcome, ChainError>> = tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|e| ChainError::Transform(format!("semaphore cerrado: {e}")))?;
            task.broadcast_receiver(message, &storage).await
        });

        let peer = self.storage.peer_id();
        Some(tokio::spawn(async move {
            match invocation.await {
                Ok(Ok(outcome)) => {
                    debug!("peer {} etapa {} -> {:?}", peer.short(), stage, outcome);
                    Some(outcome)
                }
                Ok(Err(e)) => {
                    warn!("peer {} etapa {} abortada: {}", peer.short(), stage, e);
                    None
                }
                Err(e) => {
                    warn!(
                        "peer {} etapa {} terminó con panic o join error: {:?}",
                        peer.short(),
                        stage,
                        e
                    );
                    None
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::MemoryOverlay;
    use crate::task::Task;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Probe {
        calls: Arc<AtomicUsize>,
        panic: bool,
    }

    #[async_trait]
    impl Task for Probe {
        fn previous_id(&self) -> Key {
            Key::same("MAP")
        }

        fn current_id(&self) -> Key {
            Key::same("REDUCE")
        }

        async fn broadcast_receiver(
            &self,
            _input: Context,
            _storage: &PeerStorage,
        ) -> Result<StageOutcome, ChainError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.panic {
                panic!("transform explotó");
            }
            Ok(StageOutcome::Completed)
        }
    }

    fn message() -> Context {
        let mut ctx = Context::new();
        ctx.put_as(ContextKey::CurrentTask, &Key::same("MAP")).unwrap();
        ctx.put_as(ContextKey::NextTask, &Key::same("REDUCE")).unwrap();
        ctx
    }

    fn runtime(panic: bool) -> (PeerRuntime, Arc<AtomicUsize>) {
        let overlay = MemoryOverlay::new(1);
        let (dht, _inbox) = overlay.join();
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = TaskRegistry::builder()
            .register(Arc::new(Probe {
                calls: calls.clone(),
                panic,
            }))
            .build();
        (
            PeerRuntime::new(registry, PeerStorage::new(Arc::new(dht)), 2),
            calls,
        )
    }

    #[tokio::test]
    async fn dispatch_invoca_la_tarea() {
        let (rt, calls) = runtime(false);
        let handle = rt.dispatch(message()).unwrap();
        assert_eq!(handle.await.unwrap(), Some(StageOutcome::Completed));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispatch_ignora_mensajes_sin_tarea() {
        let (rt, calls) = runtime(false);
        let mut other = message();
        other.put_as(ContextKey::NextTask, &Key::same("WRITE")).unwrap();
        assert!(rt.dispatch(other).is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn panic_en_la_etapa_no_tumba_el_peer() {
        let (rt, calls) = runtime(true);
        let handle = rt.dispatch(message()).unwrap();
        assert_eq!(handle.await.unwrap(), None);

        // el runtime sigue aceptando mensajes
        let handle = rt.dispatch(message()).unwrap();
        assert_eq!(handle.await.unwrap(), None);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn run_procesa_el_inbox_hasta_que_se_cierra() {
        let (rt, calls) = runtime(false);
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(message()).unwrap();
        tx.send(message()).unwrap();
        drop(tx);

        rt.run(rx).await;

        // las invocaciones son asíncronas: esperamos a que terminen
        for _ in 0..50 {
            if calls.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
