//! Registro de tareas por id de etapa.
//!
//! Se arma una sola vez al arrancar el peer y después es de sólo lectura.

use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::context::{Context, ContextKey};
use crate::key::Key;
use crate::task::Task;

pub struct TaskRegistry {
    tasks: BTreeMap<Key, Arc<dyn Task>>,
}

#[derive(Default)]
pub struct TaskRegistryBuilder {
    tasks: BTreeMap<Key, Arc<dyn Task>>,
}

impl TaskRegistryBuilder {
    /// Registra la tarea bajo su `current_id`. Si ya había una, la pisa.
    pub fn register(mut self, task: Arc<dyn Task>) -> Self {
        let id = task.current_id();
        if self.tasks.insert(id, task).is_some() {
            warn!("etapa {} registrada dos veces, queda la última", id);
        } else {
            info!("registrada etapa {}", id);
        }
        self
    }

    pub fn build(self) -> Arc<TaskRegistry> {
        Arc::new(TaskRegistry { tasks: self.tasks })
    }
}

impl TaskRegistry {
    pub fn builder() -> TaskRegistryBuilder {
        TaskRegistryBuilder::default()
    }

    pub fn get(&self, stage: &Key) -> Option<Arc<dyn Task>> {
        self.tasks.get(stage).cloned()
    }

    /// Tarea a la que va dirigido el mensaje: la registrada bajo su
    /// `NEXT_TASK` y cuya etapa previa es el `CURRENT_TASK` del mensaje.
    pub fn lookup(&self, message: &Context) -> Option<Arc<dyn Task>> {
        let next: Key = message.get_as(&ContextKey::NextTask).ok().flatten()?;
        let task = self.tasks.get(&next)?;
        if task.accepts(message) {
            Some(task.clone())
        } else {
            None
        }
    }

    pub fn stage_ids(&self) -> Vec<Key> {
        self.tasks.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
