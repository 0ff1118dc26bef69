//! Etapas del word count distribuido: split -> map -> reduce -> write -> shutdown.
//!
//! Map es un [`StageTask`] genérico con [`word_count_transform`]; el resto
//! tiene lógica propia (varios Puts, fan-in o efectos locales) pero sigue
//! el mismo protocolo: Get, cálculo puro, Put en clave nueva, broadcast.

use async_trait::async_trait;
use futures::future::try_join_all;
use glob::{glob, Pattern};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::context::{Context, ContextKey};
use crate::convergence::{FanIn, FanInTracker};
use crate::error::ChainError;
use crate::key::{Id, Key};
use crate::storage::PeerStorage;
use crate::task::{next_context, next_execution_id, propagate, StageOutcome, StageTask, Task};
use crate::wordcount::{
    decode_counts, encode_counts, merge_counts, render_csv, split_text, word_count_transform,
    write_counts_csv, WordCounts,
};

fn transform_error(e: anyhow::Error) -> ChainError {
    ChainError::Transform(format!("{e:#}"))
}

/// Sin `RECEIVERS` el mensaje es para todos.
fn addressed_to(input: &Context, storage: &PeerStorage) -> bool {
    match input.get_as::<Vec<String>>(&ContextKey::Receivers) {
        Ok(Some(receivers)) => receivers.contains(&storage.peer_address()),
        Ok(None) => true,
        Err(_) => false,
    }
}

/// Archivos de entrada: el path mismo si es un archivo, o los archivos
/// directos del directorio, ordenados.
fn input_files(path: &Path) -> Result<Vec<PathBuf>, ChainError> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let pattern = Path::new(&Pattern::escape(&path.to_string_lossy())).join("*");
    let pattern = pattern.to_string_lossy();
    let entries = glob(&pattern).map_err(|e| ChainError::MalformedContext {
        key: ContextKey::InputPath,
        reason: format!("invalid pattern {pattern}: {e}"),
    })?;

    let mut files = Vec::new();
    for entry in entries {
        match entry {
            Ok(file) if file.is_file() => files.push(file),
            Ok(_) => {}
            Err(e) => warn!("no se pudo leer una entrada de {}: {}", pattern, e),
        }
    }
    files.sort();
    Ok(files)
}

/* --------------------------- split --------------------------- */

/// Parte la entrada en splits, los guarda y lanza un map por split.
pub struct SplitTask {
    previous_id: Key,
    current_id: Key,
    executions: u32,
    max_split_bytes: usize,
}

impl SplitTask {
    pub fn new(previous_id: Key, current_id: Key, executions: u32) -> Self {
        Self {
            previous_id,
            current_id,
            executions: executions.max(1),
            max_split_bytes: 0,
        }
    }

    pub fn max_split_bytes(mut self, max_split_bytes: usize) -> Self {
        self.max_split_bytes = max_split_bytes;
        self
    }

    async fn read_splits(&self, path: &Path) -> Result<Vec<(String, String)>, ChainError> {
        let files = input_files(path)?;
        if files.is_empty() {
            return Err(ChainError::MalformedContext {
                key: ContextKey::InputPath,
                reason: format!("{} has no input files", path.display()),
            });
        }

        let mut splits = Vec::new();
        for file in files {
            let text = tokio::fs::read_to_string(&file).await?;
            for (i, chunk) in split_text(&text, self.max_split_bytes).into_iter().enumerate() {
                splits.push((format!("{}#{}", file.display(), i), chunk));
            }
        }
        Ok(splits)
    }
}

#[async_trait]
impl Task for SplitTask {
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
        let job: String = input.require(&ContextKey::JobKey)?;
        let path: String = input.require(&ContextKey::InputPath)?;
        info!(">>> start split [{}] job={} input={}", exec_id, job, path);

        let splits = self.read_splits(Path::new(&path)).await?;

        let mut wired = input.clone();
        wired.put_as(ContextKey::NumberOfFiles, &splits.len())?;

        // todos los Puts antes del primer broadcast
        let mut written = Vec::with_capacity(splits.len());
        for (name, chunk) in splits {
            let location = Id::hash(format!("{job}/{name}"));
            let key = storage
                .put(location, storage.fresh_domain(), chunk.into_bytes())
                .replication(self.executions)
                .start()
                .await?;
            debug!("split {} -> {}", name, key);
            written.push(key);
        }

        let mut broadcasts = Vec::with_capacity(written.len());
        for key in &written {
            let next = next_context(
                &wired,
                storage,
                &ContextKey::InputTaskId,
                &ContextKey::MapTaskId,
                key,
            )?;
            broadcasts.push(propagate(storage, next));
        }
        try_join_all(broadcasts).await?;

        info!(">>> fin split [{}] {} splits", exec_id, written.len());
        Ok(StageOutcome::Fanned(written))
    }
}

/* ---------------------------- map ---------------------------- */

/// Map del word count: texto del split -> conteos.
pub fn map_task(previous_id: Key, current_id: Key, executions: u32, replay: bool) -> StageTask {
    StageTask::new(
        "map",
        previous_id,
        current_id,
        ContextKey::MapTaskId,
        ContextKey::ReduceTaskId,
        Arc::new(word_count_transform),
    )
    .executions(executions)
    .replay(replay)
}

/* --------------------------- reduce -------------------------- */

/// Fan-in: espera `executions` salidas de map por split y junta los conteos
/// una sola vez por job.
pub struct ReduceTask {
    previous_id: Key,
    current_id: Key,
    replay: bool,
    tracker: FanInTracker,
}

impl ReduceTask {
    pub fn new(previous_id: Key, current_id: Key, executions: u32) -> Self {
        Self {
            previous_id,
            current_id,
            replay: true,
            tracker: FanInTracker::new(executions),
        }
    }

    pub fn replay(mut self, enabled: bool) -> Self {
        self.replay = enabled;
        self
    }

    pub fn tracker(&self) -> &FanInTracker {
        &self.tracker
    }

    async fn aggregate(
        &self,
        input: &Context,
        storage: &PeerStorage,
        outputs: &[Key],
    ) -> Result<WordCounts, ChainError> {
        let mut total = WordCounts::new();
        for key in outputs {
            let mut get = storage.get_key(key);
            if self.replay {
                get = get.broadcast_input(input);
            }
            let counts = decode_counts(&get.start().await?).map_err(transform_error)?;
            merge_counts(&mut total, counts);
        }
        Ok(total)
    }

    async fn finish(
        &self,
        job: &str,
        input: &Context,
        storage: &PeerStorage,
        outputs: &[Key],
    ) -> Result<Key, ChainError> {
        let total = self.aggregate(input, storage, outputs).await?;
        let bytes = encode_counts(&total).map_err(transform_error)?;

        let written = storage
            .put(Id::hash(job), storage.fresh_domain(), bytes)
            .replication(self.tracker.executions() as u32)
            .start()
            .await?;

        let next = next_context(
            input,
            storage,
            &ContextKey::ReduceTaskId,
            &ContextKey::WriteTaskId,
            &written,
        )?;
        propagate(storage, next).await?;
        Ok(written)
    }
}

#[async_trait]
impl Task for ReduceTask {
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

        let job: String = input.require(&ContextKey::JobKey)?;
        let expected: usize = input.require(&ContextKey::NumberOfFiles)?;
        let output: Key = input.require(&ContextKey::OutputStorageKey)?;

        let outputs = match self.tracker.observe(&job, output, expected) {
            FanIn::Waiting { ready, required } => {
                info!(
                    "reduce job={} esperando: {}/{} splits listos ({} de {} ejecuciones en {})",
                    job,
                    ready,
                    required,
                    self.tracker.observed(&job, output.location()),
                    self.tracker.executions(),
                    output.location().short()
                );
                return Ok(StageOutcome::Pending);
            }
            FanIn::Finished => {
                debug!("reduce job={} ya convergió, se ignora {}", job, output);
                return Ok(StageOutcome::Ignored);
            }
            FanIn::Converged(outputs) => outputs,
        };

        let exec_id = next_execution_id();
        info!(">>> start reduce [{}] job={} con {} salidas", exec_id, job, outputs.len());

        match self.finish(&job, &input, storage, &outputs).await {
            Ok(written) => {
                info!(">>> fin reduce [{}] salida {}", exec_id, written);
                Ok(StageOutcome::Propagated(written))
            }
            Err(e) => {
                warn!("reduce [{}] abortada: {}", exec_id, e);
                if self.replay {
                    storage.release(&input);
                }
                self.tracker.reopen(&job);
                Err(e)
            }
        }
    }
}

/* ---------------------------- write -------------------------- */

/// Nombre del CSV final de un job.
pub fn output_file_name(job: &str) -> String {
    format!("wordcount-{}.csv", Id::hash(job).short())
}

/// Baja el agregado a CSV. Sólo corre en los peers de `RECEIVERS` y una vez
/// por job.
pub struct WriteTask {
    previous_id: Key,
    current_id: Key,
    executions: u32,
    replay: bool,
    output_dir: Option<PathBuf>,
    seen: FanInTracker,
}

impl WriteTask {
    pub fn new(previous_id: Key, current_id: Key, output_dir: Option<PathBuf>) -> Self {
        Self {
            previous_id,
            current_id,
            executions: 1,
            replay: true,
            output_dir,
            seen: FanInTracker::new(1),
        }
    }

    /// Replication count del Put del CSV.
    pub fn executions(mut self, executions: u32) -> Self {
        self.executions = executions.max(1);
        self
    }

    pub fn replay(mut self, enabled: bool) -> Self {
        self.replay = enabled;
        self
    }

    async fn write(
        &self,
        job: &str,
        input: &Context,
        storage: &PeerStorage,
        aggregate: &Key,
    ) -> Result<Key, ChainError> {
        let mut get = storage.get_key(aggregate);
        if self.replay {
            get = get.broadcast_input(input);
        }
        let counts = decode_counts(&get.start().await?).map_err(transform_error)?;
        let csv = render_csv(&counts).map_err(transform_error)?;

        let written = storage
            .put(aggregate.location(), storage.fresh_domain(), csv)
            .replication(self.executions)
            .start()
            .await?;

        // el archivo sólo se escribe si el Put quedó guardado
        if let Some(dir) = &self.output_dir {
            let path = dir.join(output_file_name(job));
            let words = counts.len();
            let target = path.clone();
            tokio::task::spawn_blocking(move || write_counts_csv(&counts, &target))
                .await
                .map_err(|e| ChainError::Transform(format!("escritura del csv: {e}")))?
                .map_err(transform_error)?;
            info!("job={} escrito en {} ({} palabras)", job, path.display(), words);
        }

        let next = next_context(
            input,
            storage,
            &ContextKey::WriteTaskId,
            &ContextKey::ShutdownTaskId,
            &written,
        )?;
        propagate(storage, next).await?;
        Ok(written)
    }
}

#[async_trait]
impl Task for WriteTask {
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
        if !self.accepts(&input) || !addressed_to(&input, storage) {
            return Ok(StageOutcome::Ignored);
        }

        let job: String = input.require(&ContextKey::JobKey)?;
        let aggregate: Key = input.require(&ContextKey::OutputStorageKey)?;

        if !matches!(self.seen.observe(&job, aggregate, 1), FanIn::Converged(_)) {
            debug!("write job={} ya hecho, se ignora {}", job, aggregate);
            return Ok(StageOutcome::Ignored);
        }

        let exec_id = next_execution_id();
        info!(">>> start write [{}] job={}", exec_id, job);

        match self.write(&job, &input, storage, &aggregate).await {
            Ok(written) => {
                info!(">>> fin write [{}] salida {}", exec_id, written);
                Ok(StageOutcome::Propagated(written))
            }
            Err(e) => {
                warn!("write [{}] abortada: {}", exec_id, e);
                if self.replay {
                    storage.release(&input);
                }
                self.seen.reopen(&job);
                Err(e)
            }
        }
    }
}

/* -------------------------- shutdown ------------------------- */

/// Fin de un job, visible fuera de la cadena de broadcasts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    pub job: String,
    /// Conteos agregados (JSON).
    pub aggregate: Key,
    /// CSV final.
    pub output: Key,
    /// Peer que corrió el write.
    pub sender: Option<String>,
}

/// Etapa terminal: publica el [`JobOutcome`] una vez por job.
pub struct ShutdownTask {
    previous_id: Key,
    current_id: Key,
    outcomes: Option<mpsc::UnboundedSender<JobOutcome>>,
    seen: FanInTracker,
}

impl ShutdownTask {
    pub fn new(
        previous_id: Key,
        current_id: Key,
        outcomes: Option<mpsc::UnboundedSender<JobOutcome>>,
    ) -> Self {
        Self {
            previous_id,
            current_id,
            outcomes,
            seen: FanInTracker::new(1),
        }
    }
}

#[async_trait]
impl Task for ShutdownTask {
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
        if !self.accepts(&input) || !addressed_to(&input, storage) {
            return Ok(StageOutcome::Ignored);
        }

        let job: String = input.require(&ContextKey::JobKey)?;
        let output: Key = input.require(&ContextKey::OutputStorageKey)?;
        let aggregate: Key = input.require(&ContextKey::InputStorageKey)?;

        if !matches!(self.seen.observe(&job, output, 1), FanIn::Converged(_)) {
            return Ok(StageOutcome::Ignored);
        }

        let outcome = JobOutcome {
            job: job.clone(),
            aggregate,
            output,
            sender: input.get_as(&ContextKey::Sender)?,
        };
        info!("job {} terminado, salida {}", job, output);

        match &self.outcomes {
            Some(tx) => {
                if tx.send(outcome).is_err() {
                    warn!("nadie escucha el fin del job {}", job);
                }
            }
            None => debug!("peer {} sin canal de salida", storage.peer_id().short()),
        }
        Ok(StageOutcome::Completed)
    }
}
