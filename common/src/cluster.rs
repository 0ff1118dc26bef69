//! Cluster local: N peers sobre un [`MemoryOverlay`] dentro del proceso.
//!
//! El peer 0 es el que envía los jobs: tiene el directorio de salida y el
//! canal por el que vuelven los [`JobOutcome`].

use anyhow::{bail, ensure, Context as _};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::PeerConfig;
use crate::job::{Job, JobWiring};
use crate::overlay::MemoryOverlay;
use crate::peer::PeerRuntime;
use crate::stages::JobOutcome;
use crate::storage::PeerStorage;

struct LocalPeer {
    runtime: PeerRuntime,
    handle: JoinHandle<()>,
}

pub struct LocalCluster {
    overlay: MemoryOverlay,
    wiring: JobWiring,
    peers: Vec<LocalPeer>,
    outcomes: mpsc::UnboundedReceiver<JobOutcome>,
}

impl LocalCluster {
    /// Levanta `peers` peers con el registro del word count. Necesita un
    /// runtime tokio activo.
    pub fn start(
        config: &PeerConfig,
        peers: usize,
        output_dir: Option<PathBuf>,
    ) -> anyhow::Result<Self> {
        config.validate()?;
        ensure!(
            peers >= config.executions as usize,
            "se necesitan al menos {} peers para {} ejecuciones por split (hay {})",
            config.executions,
            config.executions,
            peers
        );

        let overlay = MemoryOverlay::new(config.max_resends);
        let wiring = JobWiring::word_count();
        let (tx, outcomes) = mpsc::unbounded_channel();

        let mut local = Vec::with_capacity(peers);
        for i in 0..peers {
            let (dht, inbox) = overlay.join();
            let registry = if i == 0 {
                wiring.registry(config, output_dir.clone(), Some(tx.clone()))
            } else {
                wiring.registry(config, None, None)
            };
            let runtime = PeerRuntime::new(
                registry,
                PeerStorage::new(std::sync::Arc::new(dht)),
                config.max_concurrency,
            );
            let handle = tokio::spawn(runtime.clone().run(inbox));
            local.push(LocalPeer { runtime, handle });
        }

        info!("cluster local con {} peers", peers);
        Ok(Self {
            overlay,
            wiring,
            peers: local,
            outcomes,
        })
    }

    pub fn overlay(&self) -> &MemoryOverlay {
        &self.overlay
    }

    pub fn submitter(&self) -> Option<&PeerRuntime> {
        self.peers.first().map(|p| &p.runtime)
    }

    /// Envía un job sobre `input` y espera su fin.
    pub async fn run_job(
        &mut self,
        input: &Path,
        timeout: Duration,
    ) -> anyhow::Result<(Job, JobOutcome)> {
        let submitter = self.submitter().context("cluster sin peers")?;
        let job = Job::new(self.wiring);
        let split = job.submit(submitter, input)?;

        if split.await?.is_none() {
            bail!("el split del job {} abortó (ver logs)", job.id);
        }

        let deadline = Instant::now() + timeout;
        loop {
            match tokio::time::timeout_at(deadline, self.outcomes.recv()).await {
                Ok(Some(outcome)) if outcome.job == job.id => {
                    let elapsed = chrono::Utc::now() - job.submitted_at;
                    info!("job {} listo en {} ms", job.id, elapsed.num_milliseconds());
                    return Ok((job, outcome));
                }
                Ok(Some(other)) => warn!("fin de otro job {}, se descarta", other.job),
                Ok(None) => bail!("el canal de resultados se cerró"),
                Err(_) => bail!("job {} sin terminar después de {:?}", job.id, timeout),
            }
        }
    }

    pub fn shutdown(self) {
        for peer in self.peers {
            peer.handle.abort();
        }
    }
}
