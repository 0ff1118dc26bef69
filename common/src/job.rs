use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::config::PeerConfig;
use crate::context::{Context, ContextKey};
use crate::error::ChainError;
use crate::key::{time_random_id, Key};
use crate::peer::PeerRuntime;
use crate::registry::TaskRegistry;
use crate::stages::{map_task, JobOutcome, ReduceTask, ShutdownTask, SplitTask, WriteTask};
use crate::task::StageOutcome;

pub type JobId = String;

/// Ids de etapa de un pipeline. Viajan en el primer contexto y cada etapa
/// los copia: la topología es dato, no código.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobWiring {
    /// Etapa "previa" al split: quien envía el job.
    pub submit: Key,
    pub input: Key,
    pub map: Key,
    pub reduce: Key,
    pub write: Key,
    pub shutdown: Key,
}

impl JobWiring {
    pub fn word_count() -> Self {
        Self {
            submit: Key::same("SUBMITTASKID"),
            input: Key::same("INPUTTASKID"),
            map: Key::same("MAPTASKID"),
            reduce: Key::same("REDUCETASKID"),
            write: Key::same("WRITETASKID"),
            shutdown: Key::same("SHUTDOWNTASKID"),
        }
    }

    pub fn write_into(&self, ctx: &mut Context) -> Result<(), ChainError> {
        ctx.put_as(ContextKey::InputTaskId, &self.input)?;
        ctx.put_as(ContextKey::MapTaskId, &self.map)?;
        ctx.put_as(ContextKey::ReduceTaskId, &self.reduce)?;
        ctx.put_as(ContextKey::WriteTaskId, &self.write)?;
        ctx.put_as(ContextKey::ShutdownTaskId, &self.shutdown)?;
        Ok(())
    }

    /// Registro con las cinco etapas del word count.
    /// `output_dir` y `outcomes` sólo tienen sentido en el peer que envía jobs.
    pub fn registry(
        &self,
        config: &PeerConfig,
        output_dir: Option<PathBuf>,
        outcomes: Option<mpsc::UnboundedSender<JobOutcome>>,
    ) -> Arc<TaskRegistry> {
        TaskRegistry::builder()
            .register(Arc::new(
                SplitTask::new(self.submit, self.input, config.executions)
                    .max_split_bytes(config.max_split_bytes),
            ))
            .register(Arc::new(map_task(
                self.input,
                self.map,
                config.executions,
                config.replay_enabled,
            )))
            .register(Arc::new(
                ReduceTask::new(self.map, self.reduce, config.executions)
                    .replay(config.replay_enabled),
            ))
            .register(Arc::new(
                WriteTask::new(self.reduce, self.write, output_dir)
                    .executions(config.executions)
                    .replay(config.replay_enabled),
            ))
            .register(Arc::new(ShutdownTask::new(self.write, self.shutdown, outcomes)))
            .build()
    }
}

/// Un job enviado desde un peer.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub wiring: JobWiring,
    pub submitted_at: DateTime<Utc>,
}

impl Job {
    pub fn new(wiring: JobWiring) -> Self {
        Self {
            id: time_random_id("JOB"),
            wiring,
            submitted_at: Utc::now(),
        }
    }

    /// Primer contexto del pipeline. Los resultados vuelven a `receivers`.
    pub fn initial_context(
        &self,
        input_path: &Path,
        sender: &str,
        receivers: Vec<String>,
    ) -> Result<Context, ChainError> {
        let mut ctx = Context::new();
        ctx.put_as(ContextKey::JobKey, &self.id)?;
        self.wiring.write_into(&mut ctx)?;
        ctx.put_as(ContextKey::Receivers, &receivers)?;
        ctx.put_as(ContextKey::Sender, &sender.to_string())?;
        ctx.put_as(ContextKey::CurrentTask, &self.wiring.submit)?;
        ctx.put_as(ContextKey::NextTask, &self.wiring.input)?;
        ctx.put_as(
            ContextKey::InputPath,
            &input_path.to_string_lossy().to_string(),
        )?;
        Ok(ctx)
    }

    /// Arranca el job en el split del propio peer: la entrada es local a él.
    pub fn submit(
        &self,
        peer: &PeerRuntime,
        input_path: &Path,
    ) -> Result<JoinHandle<Option<StageOutcome>>, ChainError> {
        let me = peer.storage().peer_address();
        let ctx = self.initial_context(input_path, &me, vec![me.clone()])?;

        info!(
            "job {} enviado desde {} sobre {}",
            self.id,
            me,
            input_path.display()
        );
        peer.dispatch(ctx)
            .ok_or_else(|| ChainError::NoMatchingTask(self.wiring.input.to_string()))
    }
}
