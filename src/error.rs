//! Error types for the inference session.

use std::path::PathBuf;

use thiserror::Error;

/// Failures while turning an engine directory (or a settings file) into configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("engine directory does not exist: {0}")]
    MissingDirectory(PathBuf),

    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },

    #[error("cannot load settings {path}: {reason}")]
    Settings { path: PathBuf, reason: String },
}

#[derive(Debug, Error)]
pub enum TokenizerError {
    #[error("cannot load tokenizer from {path}: {reason}")]
    Load { path: PathBuf, reason: String },

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("token id {0} is outside the vocabulary")]
    OutOfVocabulary(u32),

    #[error("decode failed: {0}")]
    Decode(String),
}

/// A request rejected locally, before it could reach the engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RequestError {
    #[error("invalid request: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine launch failed: {0}")]
    Launch(String),

    #[error("engine refused request: {0}")]
    Enqueue(String),

    #[error("engine has shut down")]
    Shutdown,
}

/// Orchestrator-level taxonomy. Startup variants abort the session; the rest
/// are raised only when a run mode cannot continue at all.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("startup configuration error: {0}")]
    StartupConfig(#[from] ConfigError),

    #[error("tokenizer error: {0}")]
    Tokenizer(#[from] TokenizerError),

    #[error("engine kept refusing request #{correlation_id} after {attempts} attempts")]
    AdmissionExhausted { correlation_id: u64, attempts: u32 },

    #[error(transparent)]
    InvalidRequest(#[from] RequestError),

    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// True for failures that happen before any request reaches the engine.
    pub fn is_startup(&self) -> bool {
        matches!(
            self,
            SessionError::StartupConfig(_)
                | SessionError::Tokenizer(_)
                | SessionError::InvalidRequest(_)
                | SessionError::Engine(EngineError::Launch(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
