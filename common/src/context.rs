use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::ChainError;

/// Vocabulario fijo de claves simbólicas que comparten todas las etapas.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ContextKey {
    JobKey,
    NumberOfFiles,
    InputTaskId,
    MapTaskId,
    ReduceTaskId,
    WriteTaskId,
    ShutdownTaskId,
    Receivers,
    Sender,
    CurrentTask,
    NextTask,
    InputStorageKey,
    OutputStorageKey,
    InputPath,
    /// Claves propias de la aplicación.
    Custom(String),
}

impl ContextKey {
    /// Claves de todo el job que cada etapa copia sin tocar.
    pub fn job_wide() -> [ContextKey; 8] {
        [
            ContextKey::JobKey,
            ContextKey::NumberOfFiles,
            ContextKey::InputTaskId,
            ContextKey::MapTaskId,
            ContextKey::ReduceTaskId,
            ContextKey::WriteTaskId,
            ContextKey::ShutdownTaskId,
            ContextKey::Receivers,
        ]
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ContextKey::JobKey => "JOB_KEY",
            ContextKey::NumberOfFiles => "NUMBEROFFILES",
            ContextKey::InputTaskId => "INPUTTASKID",
            ContextKey::MapTaskId => "MAPTASKID",
            ContextKey::ReduceTaskId => "REDUCETASKID",
            ContextKey::WriteTaskId => "WRITETASKID",
            ContextKey::ShutdownTaskId => "SHUTDOWNTASKID",
            ContextKey::Receivers => "RECEIVERS",
            ContextKey::Sender => "SENDER",
            ContextKey::CurrentTask => "CURRENT_TASK",
            ContextKey::NextTask => "NEXT_TASK",
            ContextKey::InputStorageKey => "INPUT_STORAGE_KEY",
            ContextKey::OutputStorageKey => "OUTPUT_STORAGE_KEY",
            ContextKey::InputPath => "INPUT_PATH",
            ContextKey::Custom(name) => return write!(f, "CUSTOM({})", name),
        };
        f.write_str(name)
    }
}

/// Mensaje que viaja entre etapas: mapa ordenado clave simbólica -> bytes opacos.
///
/// Los valores se guardan serializados (JSON) y deben poder volver a
/// deserializarse al tipo del que salieron.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    entries: BTreeMap<ContextKey, Vec<u8>>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &ContextKey) -> Option<&[u8]> {
        self.entries.get(key).map(|v| v.as_slice())
    }

    /// Inserta o pisa. Devuelve el valor anterior si lo había.
    pub fn put(&mut self, key: ContextKey, value: Vec<u8>) -> Option<Vec<u8>> {
        self.entries.insert(key, value)
    }

    pub fn put_as<T: Serialize>(&mut self, key: ContextKey, value: &T) -> Result<(), ChainError> {
        let bytes = serde_json::to_vec(value).map_err(|e| ChainError::MalformedContext {
            key: key.clone(),
            reason: format!("cannot be encoded: {e}"),
        })?;
        self.entries.insert(key, bytes);
        Ok(())
    }

    /// `Ok(None)` si la clave no está; error sólo si el valor no decodifica.
    pub fn get_as<T: DeserializeOwned>(&self, key: &ContextKey) -> Result<Option<T>, ChainError> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(bytes)
                .map(Some)
                .map_err(|e| ChainError::MalformedContext {
                    key: key.clone(),
                    reason: format!("cannot be decoded: {e}"),
                }),
        }
    }

    /// Como `get_as`, pero la clave es obligatoria.
    pub fn require<T: DeserializeOwned>(&self, key: &ContextKey) -> Result<T, ChainError> {
        self.get_as(key)?
            .ok_or_else(|| ChainError::missing(key.clone()))
    }

    pub fn contains(&self, key: &ContextKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &ContextKey) -> Option<Vec<u8>> {
        self.entries.remove(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &ContextKey> {
        self.entries.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ContextKey, &[u8])> {
        self.entries.iter().map(|(k, v)| (k, v.as_slice()))
    }

    /// Contexto nuevo con sólo las claves pedidas que existan en `self`.
    /// Las que falten se saltan sin error; `self` no se toca.
    pub fn project(&self, keys: &[ContextKey]) -> Context {
        let mut out = Context::new();
        for key in keys {
            if let Some(value) = self.entries.get(key) {
                out.entries.insert(key.clone(), value.clone());
            }
        }
        out
    }
}

impl FromIterator<(ContextKey, Vec<u8>)> for Context {
    fn from_iter<I: IntoIterator<Item = (ContextKey, Vec<u8>)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{Id, Key};

    fn sample() -> Context {
        let mut ctx = Context::new();
        ctx.put_as(ContextKey::JobKey, &"job-1".to_string()).unwrap();
        ctx.put_as(ContextKey::NumberOfFiles, &3usize).unwrap();
        ctx.put_as(ContextKey::MapTaskId, &Key::same("MAPTASKID")).unwrap();
        ctx.put(ContextKey::Custom("raw".into()), vec![1, 2, 3]);
        ctx
    }

    #[test]
    fn get_de_clave_ausente_no_falla() {
        let ctx = sample();
        assert!(ctx.get(&ContextKey::Sender).is_none());
        assert_eq!(ctx.get_as::<String>(&ContextKey::Sender).unwrap(), None);
    }

    #[test]
    fn require_de_clave_ausente_es_malformed() {
        let ctx = sample();
        let err = ctx.require::<String>(&ContextKey::Sender).unwrap_err();
        assert!(matches!(err, ChainError::MalformedContext { key: ContextKey::Sender, .. }));
    }

    #[test]
    fn valor_con_tipo_equivocado_es_malformed() {
        let ctx = sample();
        let err = ctx.get_as::<Key>(&ContextKey::JobKey).unwrap_err();
        assert!(matches!(err, ChainError::MalformedContext { .. }));
    }

    #[test]
    fn put_pisa_el_valor_anterior() {
        let mut ctx = sample();
        let old = ctx.put(ContextKey::Custom("raw".into()), vec![9]);
        assert_eq!(old, Some(vec![1, 2, 3]));
        assert_eq!(ctx.get(&ContextKey::Custom("raw".into())), Some(&[9u8][..]));
    }

    #[test]
    fn valores_vuelven_al_tipo_original() {
        let ctx = sample();
        assert_eq!(ctx.require::<String>(&ContextKey::JobKey).unwrap(), "job-1");
        assert_eq!(ctx.require::<usize>(&ContextKey::NumberOfFiles).unwrap(), 3);
        assert_eq!(
            ctx.require::<Key>(&ContextKey::MapTaskId).unwrap(),
            Key::same("MAPTASKID")
        );
    }

    #[test]
    fn project_deja_exactamente_la_interseccion() {
        let ctx = sample();
        let keys = [
            ContextKey::JobKey,
            ContextKey::MapTaskId,
            ContextKey::Sender, // no está en ctx
        ];

        let out = ctx.project(&keys);

        assert_eq!(out.len(), 2);
        assert_eq!(out.get(&ContextKey::JobKey), ctx.get(&ContextKey::JobKey));
        assert_eq!(out.get(&ContextKey::MapTaskId), ctx.get(&ContextKey::MapTaskId));
        assert!(!out.contains(&ContextKey::Sender));
        assert!(!out.contains(&ContextKey::NumberOfFiles));
    }

    #[test]
    fn mutar_la_proyeccion_no_afecta_el_origen() {
        let ctx = sample();
        let before = ctx.clone();

        let mut out = ctx.project(&ContextKey::job_wide());
        out.put_as(ContextKey::JobKey, &"otro".to_string()).unwrap();
        out.remove(&ContextKey::NumberOfFiles);
        out.put_as(ContextKey::OutputStorageKey, &Key::from(Id::random()))
            .unwrap();

        assert_eq!(ctx, before);
    }

    #[test]
    fn iteracion_en_orden_del_vocabulario() {
        let ctx = sample();
        let keys: Vec<&ContextKey> = ctx.keys().collect();
        assert_eq!(keys[0], &ContextKey::JobKey);
        assert_eq!(keys[1], &ContextKey::NumberOfFiles);
        assert_eq!(keys[2], &ContextKey::MapTaskId);
    }

    #[test]
    fn display_usa_nombres_del_vocabulario() {
        assert_eq!(ContextKey::OutputStorageKey.to_string(), "OUTPUT_STORAGE_KEY");
        assert_eq!(ContextKey::Custom("x".into()).to_string(), "CUSTOM(x)");
    }
}
