//! Tareas encadenadas.
//!
//! Cada etapa reacciona a un broadcast, lee su entrada del DHT, calcula,
//! escribe la salida en una clave nueva y vuelve a hacer broadcast de un
//! contexto proyectado para la etapa siguiente:
//!
//! ```text
//! Idle -> Fetching -> Computing -> Storing -> Propagating -> Idle
//!            |                        |
//!            +------> Aborted <-------+
//! ```
//!
//! No hay reintentos dentro de la tarea: si un Get o un Put falla la etapa
//! se aborta, la entrada queda intacta en el DHT y la recuperación queda en
//! manos del replay del overlay.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::context::{Context, ContextKey};
use crate::error::ChainError;
use crate::key::{Id, Key, KeyPattern};
use crate::storage::PeerStorage;

/// Resultado de una invocación que no abortó.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// El mensaje no era para esta tarea.
    Ignored,
    /// Etapa de fan-in que todavía no converge.
    Pending,
    /// Se propagó un contexto con esta clave de salida.
    Propagated(Key),
    /// Se propagó un contexto por cada clave (split).
    Fanned(Vec<Key>),
    /// Etapa terminal.
    Completed,
}

/// Unidad de cómputo encadenado, identificada por (previous id, current id).
///
/// Sin estado entre invocaciones salvo la configuración de construcción.
#[async_trait]
pub trait Task: Send + Sync {
    /// Etapa que alimenta a esta.
    fn previous_id(&self) -> Key;

    /// Id de esta etapa.
    fn current_id(&self) -> Key;

    async fn broadcast_receiver(
        &self,
        input: Context,
        storage: &PeerStorage,
    ) -> Result<StageOutcome, ChainError>;

    /// Acepta el mensaje si su `CURRENT_TASK` es la etapa previa y su
    /// `NEXT_TASK` (si viene) es esta.
    fn accepts(&self, input: &Context) -> bool {
        let current = match input.get_as::<Key>(&ContextKey::CurrentTask) {
            Ok(Some(key)) => key,
            _ => return false,
        };
        if !KeyPattern::exact(&self.previous_id()).matches(&current) {
            return false;
        }
        match input.get_as::<Key>(&ContextKey::NextTask) {
            Ok(Some(next)) => KeyPattern::exact(&self.current_id()).matches(&next),
            Ok(None) => true,
            Err(_) => false,
        }
    }
}

/// Transformación pura del valor leído. Mismos bytes de entrada, mismos
/// bytes de salida: el replay puede volver a ejecutarla.
pub trait Transform: Send + Sync {
    fn apply(&self, input: &[u8]) -> anyhow::Result<Vec<u8>>;
}

impl<F> Transform for F
where
    F: Fn(&[u8]) -> anyhow::Result<Vec<u8>> + Send + Sync,
{
    fn apply(&self, input: &[u8]) -> anyhow::Result<Vec<u8>> {
        self(input)
    }
}

static EXECUTIONS: AtomicU64 = AtomicU64::new(0);

/// Id local de ejecución, sólo para correlacionar logs.
pub fn next_execution_id() -> u64 {
    EXECUTIONS.fetch_add(1, Ordering::Relaxed)
}

/// Arma el contexto de la etapa siguiente:
/// - copia las claves de todo el job sin tocarlas
/// - `SENDER` = este peer
/// - `CURRENT_TASK` = el id de `stage` según el registro del contexto entrante
/// - `NEXT_TASK` = el id de `next_stage` según ese mismo registro
/// - `INPUT_STORAGE_KEY` = la salida anterior (lo que se acaba de leer)
/// - `OUTPUT_STORAGE_KEY` = `written`
pub fn next_context(
    input: &Context,
    storage: &PeerStorage,
    stage: &ContextKey,
    next_stage: &ContextKey,
    written: &Key,
) -> Result<Context, ChainError> {
    let own_id: Key = input.require(stage)?;
    let next_id: Key = input.require(next_stage)?;

    let mut out = input.project(&ContextKey::job_wide());
    out.put_as(ContextKey::Sender, &storage.peer_address())?;
    out.put_as(ContextKey::CurrentTask, &own_id)?;
    out.put_as(ContextKey::NextTask, &next_id)?;
    if let Some(previous) = input.get(&ContextKey::OutputStorageKey) {
        out.put(ContextKey::InputStorageKey, previous.to_vec());
    }
    out.put_as(ContextKey::OutputStorageKey, written)?;
    Ok(out)
}

/// Broadcast a una semilla aleatoria: cualquier peer puede tomarlo.
pub async fn propagate(storage: &PeerStorage, context: Context) -> Result<(), ChainError> {
    storage.broadcast(Id::random(), context).await
}

/// Etapa genérica de un solo Get -> Transform -> Put (por ejemplo, map).
pub struct StageTask {
    name: String,
    previous_id: Key,
    current_id: Key,
    stage: ContextKey,
    next_stage: ContextKey,
    executions: u32,
    replay: bool,
    transform: Arc<dyn Transform>,
}

impl StageTask {
    pub fn new(
        name: &str,
        previous_id: Key,
        current_id: Key,
        stage: ContextKey,
        next_stage: ContextKey,
        transform: Arc<dyn Transform>,
    ) -> Self {
        Self {
            name: name.to_string(),
            previous_id,
            current_id,
            stage,
            next_stage,
            executions: 1,
            replay: true,
            transform,
        }
    }

    /// Replication count que acompaña al Put de la salida.
    pub fn executions(mut self, executions: u32) -> Self {
        self.executions = executions.max(1);
        self
    }

    /// Adjuntar o no el contexto disparador al Get.
    pub fn replay(mut self, enabled: bool) -> Self {
        self.replay = enabled;
        self
    }

    /// Fetching + Computing. Devuelve la clave leída y el resultado.
    pub async fn fetch_and_compute(
        &self,
        input: &Context,
        storage: &PeerStorage,
    ) -> Result<(Key, Vec<u8>), ChainError> {
        let input_key: Key = input.require(&ContextKey::OutputStorageKey)?;

        let mut get = storage.get_key(&input_key);
        if self.replay {
            get = get.broadcast_input(input);
        }
        let fetched = get.start().await?;

        let result = self
            .transform
            .apply(&fetched)
            .map_err(|e| ChainError::Transform(format!("{e:#}")))?;
        Ok((input_key, result))
    }
}

#[async_trait]
impl Task for StageTask {
    fn previous_id(&self) -> Key {
        self.previous_id
    }

    fn current_id(&self) -> Key {
        self.current_id
    }

    async fn broadcast_receiver(
        &self,
        input: Context,
        storage: &PeerStorage,
    ) -> Result<StageOutcome, ChainError> {
        if !self.accepts(&input) {
            return Ok(StageOutcome::Ignored);
        }

        let exec_id = next_execution_id();
        info!(">>> start {} [{}] en peer {}", self.name, exec_id, storage.peer_id().short());

        match self.store_and_propagate(exec_id, &input, storage).await {
            Ok(written) => {
                info!(">>> fin {} [{}] salida {}", self.name, exec_id, written);
                Ok(StageOutcome::Propagated(written))
            }
            Err(e) => {
                if self.replay {
                    storage.release(&input);
                }
                Err(e)
            }
        }
    }
}

impl StageTask {
    async fn store_and_propagate(
        &self,
        exec_id: u64,
        input: &Context,
        storage: &PeerStorage,
    ) -> Result<Key, ChainError> {
        let (input_key, result) = match self.fetch_and_compute(input, storage).await {
            Ok(v) => v,
            Err(e) => {
                warn!("{} [{}] abortada al leer/calcular: {}", self.name, exec_id, e);
                return Err(e);
            }
        };

        // misma location que la entrada, domain nuevo
        let location = input_key.location();
        let domain = storage.fresh_domain();
        let written = match storage
            .put(location, domain, result)
            .replication(self.executions)
            .start()
            .await
        {
            Ok(key) => key,
            Err(e) => {
                warn!("{} [{}] put falló: {}", self.name, exec_id, e);
                return Err(e.into());
            }
        };

        let next = next_context(input, storage, &self.stage, &self.next_stage, &written)?;
        propagate(storage, next).await?;
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ReplayBuffer;
    use crate::error::StorageError;
    use crate::storage::{Dht, PeerAddress};
    use std::sync::Mutex;

    /// DHT de prueba: guarda lo que se le pide y falla donde se le dice.
    #[derive(Default)]
    struct ScriptedDht {
        value: Option<Vec<u8>>,
        fail_put: bool,
        gets: Mutex<Vec<(Id, Id, Option<ReplayBuffer>)>>,
        puts: Mutex<Vec<(Id, Id, Vec<u8>, u32)>>,
        broadcasts: Mutex<Vec<Context>>,
    }

    #[async_trait]
    impl Dht for ScriptedDht {
        fn peer_id(&self) -> Id {
            Id::hash("peer-test")
        }

        fn peer_address(&self) -> PeerAddress {
            "peer-test".to_string()
        }

        async fn get(
            &self,
            location: Id,
            domain: Id,
            hints: Option<&ReplayBuffer>,
        ) -> Result<Vec<u8>, StorageError> {
            self.gets
                .lock()
                .unwrap()
                .push((location, domain, hints.cloned()));
            self.value
                .clone()
                .ok_or(StorageError::NotFound { location, domain })
        }

        async fn put(
            &self,
            location: Id,
            domain: Id,
            value: Vec<u8>,
            replication: u32,
        ) -> Result<(), StorageError> {
            if self.fail_put {
                return Err(StorageError::Rejected("disco lleno".into()));
            }
            self.puts
                .lock()
                .unwrap()
                .push((location, domain, value, replication));
            Ok(())
        }

        async fn broadcast(&self, _seed: Id, context: Context) -> Result<(), StorageError> {
            self.broadcasts.lock().unwrap().push(context);
            Ok(())
        }
    }

    fn upper(input: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(input.to_ascii_uppercase())
    }

    fn map_stage() -> StageTask {
        StageTask::new(
            "map",
            Key::same("INPUTTASKID"),
            Key::same("MAPTASKID"),
            ContextKey::MapTaskId,
            ContextKey::ReduceTaskId,
            Arc::new(upper),
        )
        .executions(2)
    }

    fn split_key() -> Key {
        Key::storage(Id::hash("file.txt"), Id::hash("d1"))
    }

    fn incoming() -> Context {
        let mut ctx = Context::new();
        ctx.put_as(ContextKey::JobKey, &"job".to_string()).unwrap();
        ctx.put_as(ContextKey::NumberOfFiles, &1usize).unwrap();
        ctx.put_as(ContextKey::InputTaskId, &Key::same("INPUTTASKID")).unwrap();
        ctx.put_as(ContextKey::MapTaskId, &Key::same("MAPTASKID")).unwrap();
        ctx.put_as(ContextKey::ReduceTaskId, &Key::same("REDUCETASKID")).unwrap();
        ctx.put_as(ContextKey::Receivers, &vec!["peer-a".to_string()]).unwrap();
        ctx.put_as(ContextKey::Sender, &"peer-a".to_string()).unwrap();
        ctx.put_as(ContextKey::CurrentTask, &Key::same("INPUTTASKID")).unwrap();
        ctx.put_as(ContextKey::NextTask, &Key::same("MAPTASKID")).unwrap();
        ctx.put_as(ContextKey::InputStorageKey, &Key::from(Id::hash("raw"))).unwrap();
        ctx.put_as(ContextKey::OutputStorageKey, &split_key()).unwrap();
        ctx
    }

    fn storage_with(dht: Arc<ScriptedDht>) -> PeerStorage {
        PeerStorage::new(dht)
    }

    #[tokio::test]
    async fn ignora_mensajes_de_otra_etapa() {
        let dht = Arc::new(ScriptedDht {
            value: Some(b"x".to_vec()),
            ..Default::default()
        });
        let storage = storage_with(dht.clone());

        let mut ctx = incoming();
        ctx.put_as(ContextKey::CurrentTask, &Key::same("MAPTASKID")).unwrap();
        ctx.put_as(ContextKey::NextTask, &Key::same("REDUCETASKID")).unwrap();

        let outcome = map_stage().broadcast_receiver(ctx, &storage).await.unwrap();

        assert_eq!(outcome, StageOutcome::Ignored);
        assert!(dht.gets.lock().unwrap().is_empty());
        assert!(dht.puts.lock().unwrap().is_empty());
        assert!(dht.broadcasts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn get_fallido_no_hace_put_ni_broadcast() {
        let dht = Arc::new(ScriptedDht::default());
        let storage = storage_with(dht.clone());

        let err = map_stage()
            .broadcast_receiver(incoming(), &storage)
            .await
            .unwrap_err();

        assert!(matches!(err, ChainError::Storage(StorageError::NotFound { .. })));
        assert_eq!(dht.gets.lock().unwrap().len(), 1);
        assert!(dht.puts.lock().unwrap().is_empty());
        assert!(dht.broadcasts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn put_fallido_no_hace_broadcast() {
        let dht = Arc::new(ScriptedDht {
            value: Some(b"hola".to_vec()),
            fail_put: true,
            ..Default::default()
        });
        let storage = storage_with(dht.clone());

        let err = map_stage()
            .broadcast_receiver(incoming(), &storage)
            .await
            .unwrap_err();

        assert!(matches!(err, ChainError::Storage(StorageError::Rejected(_))));
        assert!(dht.broadcasts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn contexto_sin_clave_de_entrada_es_malformed() {
        let dht = Arc::new(ScriptedDht::default());
        let storage = storage_with(dht.clone());

        let mut ctx = incoming();
        ctx.remove(&ContextKey::OutputStorageKey);

        let err = map_stage().broadcast_receiver(ctx, &storage).await.unwrap_err();
        assert!(matches!(
            err,
            ChainError::MalformedContext { key: ContextKey::OutputStorageKey, .. }
        ));
        assert!(dht.gets.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn transform_que_falla_aborta_sin_put() {
        let dht = Arc::new(ScriptedDht {
            value: Some(b"x".to_vec()),
            ..Default::default()
        });
        let storage = storage_with(dht.clone());

        let failing = StageTask::new(
            "map",
            Key::same("INPUTTASKID"),
            Key::same("MAPTASKID"),
            ContextKey::MapTaskId,
            ContextKey::ReduceTaskId,
            Arc::new(|_: &[u8]| -> anyhow::Result<Vec<u8>> { anyhow::bail!("payload roto") }),
        );

        let err = failing.broadcast_receiver(incoming(), &storage).await.unwrap_err();
        assert!(matches!(err, ChainError::Transform(ref m) if m.contains("payload roto")));
        assert!(dht.puts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn propaga_contexto_proyectado() {
        let dht = Arc::new(ScriptedDht {
            value: Some(b"hola".to_vec()),
            ..Default::default()
        });
        let storage = storage_with(dht.clone());
        let input = incoming();

        let outcome = map_stage()
            .broadcast_receiver(input.clone(), &storage)
            .await
            .unwrap();

        let puts = dht.puts.lock().unwrap();
        assert_eq!(puts.len(), 1);
        let (location, domain, value, replication) = puts[0].clone();
        assert_eq!(location, split_key().location());
        assert_ne!(domain, split_key().domain());
        assert_eq!(value, b"HOLA".to_vec());
        assert_eq!(replication, 2);

        let written = Key::storage(location, domain);
        assert_eq!(outcome, StageOutcome::Propagated(written));

        let sent = dht.broadcasts.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let next = &sent[0];

        // claves de todo el job, sin cambios
        for key in ContextKey::job_wide() {
            assert_eq!(next.get(&key), input.get(&key), "clave {key}");
        }
        assert_eq!(next.require::<String>(&ContextKey::Sender).unwrap(), "peer-test");
        assert_eq!(
            next.require::<Key>(&ContextKey::CurrentTask).unwrap(),
            Key::same("MAPTASKID")
        );
        assert_eq!(
            next.require::<Key>(&ContextKey::NextTask).unwrap(),
            Key::same("REDUCETASKID")
        );
        assert_eq!(
            next.require::<Key>(&ContextKey::InputStorageKey).unwrap(),
            split_key()
        );
        assert_eq!(next.require::<Key>(&ContextKey::OutputStorageKey).unwrap(), written);
    }

    #[tokio::test]
    async fn get_lleva_el_contexto_como_buffer_de_replay() {
        let dht = Arc::new(ScriptedDht {
            value: Some(b"hola".to_vec()),
            ..Default::default()
        });
        let storage = storage_with(dht.clone());
        let input = incoming();

        map_stage().broadcast_receiver(input.clone(), &storage).await.unwrap();

        let gets = dht.gets.lock().unwrap();
        let hints = gets[0].2.clone().expect("buffer de replay");
        assert_eq!(hints.to_context(), input);

        drop(gets);
        let no_replay = map_stage().replay(false);
        no_replay.broadcast_receiver(input, &storage).await.unwrap();
        assert!(dht.gets.lock().unwrap()[1].2.is_none());
    }

    #[tokio::test]
    async fn fetch_y_compute_son_idempotentes() {
        let dht = Arc::new(ScriptedDht {
            value: Some(b"el mismo texto".to_vec()),
            ..Default::default()
        });
        let storage = storage_with(dht);
        let stage = map_stage();
        let input = incoming();

        let (k1, first) = stage.fetch_and_compute(&input, &storage).await.unwrap();
        let (k2, second) = stage.fetch_and_compute(&input, &storage).await.unwrap();

        assert_eq!(k1, k2);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn dos_ejecuciones_usan_domains_distintos() {
        let dht = Arc::new(ScriptedDht {
            value: Some(b"hola".to_vec()),
            ..Default::default()
        });
        let storage = storage_with(dht.clone());
        let stage = map_stage();

        stage.broadcast_receiver(incoming(), &storage).await.unwrap();
        stage.broadcast_receiver(incoming(), &storage).await.unwrap();

        let puts = dht.puts.lock().unwrap();
        assert_eq!(puts[0].0, puts[1].0);
        assert_ne!(puts[0].1, puts[1].1);
    }

    #[test]
    fn accepts_sin_next_task_compara_solo_la_previa() {
        let mut ctx = incoming();
        ctx.remove(&ContextKey::NextTask);
        assert!(map_stage().accepts(&ctx));

        ctx.remove(&ContextKey::CurrentTask);
        assert!(!map_stage().accepts(&ctx));
    }

    #[test]
    fn next_context_falla_si_falta_el_id_de_la_siguiente_etapa() {
        let dht = Arc::new(ScriptedDht::default());
        let storage = storage_with(dht);
        let mut ctx = incoming();
        ctx.remove(&ContextKey::ReduceTaskId);

        let err = next_context(
            &ctx,
            &storage,
            &ContextKey::MapTaskId,
            &ContextKey::ReduceTaskId,
            &Key::from(Id::random()),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ChainError::MalformedContext { key: ContextKey::ReduceTaskId, .. }
        ));
    }
}
