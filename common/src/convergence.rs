use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;

use crate::key::{Id, Key};

/// Estado de un job en una etapa de fan-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FanIn {
    /// Faltan salidas: `ready` locations completas de `required`.
    Waiting { ready: usize, required: usize },
    /// Convergió ahora. Una clave por location (la de menor domain).
    Converged(Vec<Key>),
    /// Ya había convergido antes; no hay nada que hacer.
    Finished,
}

/// Jobs terminados que se recuerdan por tracker. Pasado el tope se olvidan
/// los más viejos.
pub const MAX_FINISHED_JOBS: usize = 1024;

#[derive(Debug, Default)]
struct JobProgress {
    outputs: BTreeMap<Id, BTreeSet<Id>>,
    finished: bool,
}

#[derive(Debug, Default)]
struct Jobs {
    progress: BTreeMap<String, JobProgress>,
    /// Jobs convergidos, del más viejo al más nuevo.
    finished: VecDeque<String>,
}

/// Cuenta las salidas observadas por job para una etapa de fan-in.
///
/// Una location está lista cuando se vieron al menos `executions` domains
/// distintos para ella; el job converge cuando hay `expected` locations
/// listas. El orden de llegada no importa.
#[derive(Debug)]
pub struct FanInTracker {
    executions: usize,
    retained: usize,
    jobs: Mutex<Jobs>,
}

impl FanInTracker {
    pub fn new(executions: u32) -> Self {
        Self {
            executions: executions.max(1) as usize,
            retained: MAX_FINISHED_JOBS,
            jobs: Mutex::new(Jobs::default()),
        }
    }

    pub fn retain_finished(mut self, jobs: usize) -> Self {
        self.retained = jobs.max(1);
        self
    }

    pub fn executions(&self) -> usize {
        self.executions
    }

    pub fn observe(&self, job: &str, output: Key, expected: usize) -> FanIn {
        let mut guard = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let jobs = &mut *guard;
        let progress = jobs.progress.entry(job.to_string()).or_default();

        if progress.finished {
            return FanIn::Finished;
        }

        progress
            .outputs
            .entry(output.location())
            .or_default()
            .insert(output.domain());

        let ready: Vec<Key> = progress
            .outputs
            .iter()
            .filter(|(_, domains)| domains.len() >= self.executions)
            .filter_map(|(location, domains)| {
                domains
                    .iter()
                    .next()
                    .map(|domain| Key::storage(*location, *domain))
            })
            .collect();

        let required = expected.max(1);
        if ready.len() < required {
            return FanIn::Waiting {
                ready: ready.len(),
                required,
            };
        }

        progress.finished = true;
        jobs.finished.push_back(job.to_string());
        while jobs.finished.len() > self.retained {
            if let Some(old) = jobs.finished.pop_front() {
                jobs.progress.remove(&old);
            }
        }
        FanIn::Converged(ready)
    }

    /// Reabre un job que convergió pero no pudo terminar la agregación,
    /// para que un replay pueda volver a dispararla.
    pub fn reopen(&self, job: &str) {
        let mut guard = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        let jobs = &mut *guard;
        if let Some(progress) = jobs.progress.get_mut(job) {
            progress.finished = false;
            jobs.finished.retain(|j| j != job);
        }
    }

    /// Cantidad de domains vistos para una location.
    pub fn observed(&self, job: &str, location: Id) -> usize {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.progress
            .get(job)
            .and_then(|p| p.outputs.get(&location))
            .map(|d| d.len())
            .unwrap_or(0)
    }

    /// Jobs con estado guardado, terminados o no.
    pub fn tracked_jobs(&self) -> usize {
        let jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        jobs.progress.len()
    }
}
