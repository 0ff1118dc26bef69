use std::env;
use std::str::FromStr;

use crate::error::ConfigError;

pub const DEFAULT_EXECUTIONS: u32 = 2;
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;
pub const DEFAULT_MAX_RESENDS: u32 = 3;

/// Configuración de un peer. Sale de variables de entorno con defaults;
/// el cliente puede pisar cada valor por flag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// Ejecuciones por split que espera el reduce (y replication de los Puts).
    pub executions: u32,
    /// Invocaciones de etapa en paralelo por peer.
    pub max_concurrency: usize,
    /// Adjuntar el contexto disparador a los Gets.
    pub replay_enabled: bool,
    /// Tope de reenvíos de un mismo buffer.
    pub max_resends: u32,
    /// Tamaño máximo de split en bytes; 0 = archivo entero.
    pub max_split_bytes: usize,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            executions: DEFAULT_EXECUTIONS,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            replay_enabled: true,
            max_resends: DEFAULT_MAX_RESENDS,
            max_split_bytes: 0,
        }
    }
}

impl PeerConfig {
    /// - MR_EXECUTIONS (default 2)
    /// - MR_MAX_CONCURRENCY (default 4)
    /// - MR_REPLAY (default true)
    /// - MR_MAX_RESENDS (default 3)
    /// - MR_SPLIT_BYTES (default 0)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            executions: parse(&lookup, "MR_EXECUTIONS")?.unwrap_or(defaults.executions),
            max_concurrency: parse(&lookup, "MR_MAX_CONCURRENCY")?
                .unwrap_or(defaults.max_concurrency),
            replay_enabled: parse_flag(&lookup, "MR_REPLAY")?.unwrap_or(defaults.replay_enabled),
            max_resends: parse(&lookup, "MR_MAX_RESENDS")?.unwrap_or(defaults.max_resends),
            max_split_bytes: parse(&lookup, "MR_SPLIT_BYTES")?.unwrap_or(defaults.max_split_bytes),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.executions == 0 {
            return Err(invalid("MR_EXECUTIONS", "must be at least 1"));
        }
        if self.max_concurrency == 0 {
            return Err(invalid("MR_MAX_CONCURRENCY", "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| invalid(key, format!("{raw:?}: {e}"))),
    }
}

fn parse_flag<F>(lookup: &F, key: &str) -> Result<Option<bool>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key).map(|s| s.trim().to_ascii_lowercase()) {
        None => Ok(None),
        Some(v) if matches!(v.as_str(), "1" | "true" | "yes" | "on") => Ok(Some(true)),
        Some(v) if matches!(v.as_str(), "0" | "false" | "no" | "off") => Ok(Some(false)),
        Some(v) => Err(invalid(key, format!("{v:?} is not a boolean"))),
    }
}
