//! Error types for node validation and reputation lookups

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, SieveError>;

#[derive(Debug, Error)]
pub enum SieveError {
    #[error("engine binary not found: {0}")]
    EngineNotFound(PathBuf),

    #[error("failed to spawn engine: {0}")]
    EngineSpawn(#[source] std::io::Error),

    #[error("engine exited during startup ({status})")]
    EngineExited { status: String },

    #[error("engine control API not ready after {secs}s")]
    EngineTimeout { secs: u64 },

    #[error("port allocation failed: found {found}/{wanted} free ports")]
    PortExhausted { found: usize, wanted: usize },

    #[error("failed to prepare engine work directory {path}: {source}")]
    WorkDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to load config from {path}: {source}")]
    ConfigLoad {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("invalid classifier data: {0}")]
    ClassifierData(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
