//! Server and registry configuration.
//!
//! Defaults suit local development; [`CollabConfig::from_env`] overrides any
//! field whose environment variable is set.

use std::time::Duration;

use coedit_core::EngineKind;

pub const ENV_BIND_ADDR: &str = "COEDIT_BIND_ADDR";
pub const ENV_ENGINE: &str = "CRDT_ENGINE";
pub const ENV_MAX_DOCUMENTS: &str = "MAX_DOCUMENTS";
pub const ENV_MAX_DOCUMENT_SIZE: &str = "MAX_DOCUMENT_SIZE";
pub const ENV_DOCUMENT_TTL_SECS: &str = "DOCUMENT_TTL_SECS";
pub const ENV_SWEEP_INTERVAL_SECS: &str = "SWEEP_INTERVAL_SECS";
pub const ENV_BROADCAST_CAPACITY: &str = "BROADCAST_CAPACITY";

/// Configuration shared by the registry, sessions and the sync server.
#[derive(Debug, Clone, PartialEq)]
pub struct CollabConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// CRDT backend used by every document in this process
    pub engine: EngineKind,
    /// Maximum number of live documents
    pub max_documents: usize,
    /// Maximum visible text size per document, in UTF-8 bytes
    pub max_document_bytes: usize,
    /// Idle time after which an empty document may be swept
    pub idle_ttl: Duration,
    /// Interval between registry sweeps
    pub sweep_interval: Duration,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:3000".to_string(),
            engine: EngineKind::Custom,
            max_documents: 1000,
            max_document_bytes: 1024 * 1024,
            idle_ttl: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(60),
            broadcast_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid value '{value}' for {var}: {reason}")]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
    pub reason: String,
}

impl CollabConfig {
    /// Defaults overridden by the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Defaults overridden by `lookup`, which maps a variable name to its value.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(addr) = lookup(ENV_BIND_ADDR) {
            config.bind_addr = addr;
        }
        if let Some(raw) = lookup(ENV_ENGINE) {
            config.engine = raw.parse().map_err(|e: coedit_core::EngineError| ConfigError {
                var: ENV_ENGINE,
                value: raw.clone(),
                reason: e.to_string(),
            })?;
        }
        if let Some(raw) = lookup(ENV_MAX_DOCUMENTS) {
            config.max_documents = parse_positive(ENV_MAX_DOCUMENTS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_MAX_DOCUMENT_SIZE) {
            config.max_document_bytes = parse_positive(ENV_MAX_DOCUMENT_SIZE, &raw)?;
        }
        if let Some(raw) = lookup(ENV_DOCUMENT_TTL_SECS) {
            config.idle_ttl = Duration::from_secs(parse_positive(ENV_DOCUMENT_TTL_SECS, &raw)? as u64);
        }
        if let Some(raw) = lookup(ENV_SWEEP_INTERVAL_SECS) {
            config.sweep_interval =
                Duration::from_secs(parse_positive(ENV_SWEEP_INTERVAL_SECS, &raw)? as u64);
        }
        if let Some(raw) = lookup(ENV_BROADCAST_CAPACITY) {
            config.broadcast_capacity = parse_positive(ENV_BROADCAST_CAPACITY, &raw)?;
        }

        Ok(config)
    }
}

fn parse_positive(var: &'static str, raw: &str) -> Result<usize, ConfigError> {
    let err = |reason: &str| ConfigError {
        var,
        value: raw.to_string(),
        reason: reason.to_string(),
    };
    match raw.trim().parse::<usize>() {
        Ok(0) => Err(err("must be greater than zero")),
        Ok(n) => Ok(n),
        Err(e) => Err(err(&e.to_string())),
    }
}
