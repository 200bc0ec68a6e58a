//! Error taxonomy surfaced by the session engine.

use std::path::PathBuf;

use pocket_engine::EngineError;
use pocket_runtime::RuntimeError;
use pocket_sampling::SamplingError;
use pocket_store::StoreError;
use pocket_tokenizer::TokenizerError;
use thiserror::Error;

/// Every failure the [`Engine`](crate::Engine) reports to its callers.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Model '{0}' is already registered")]
    AlreadyRegistered(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Checksum mismatch for model '{name}': registered {expected}, file has {actual}")]
    ChecksumMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("IO error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Model load failed: {0}")]
    ModelLoad(String),

    #[error("Chat history unavailable: {0}")]
    HistoryUnavailable(String),

    #[error("Context overflow: {needed} tokens needed, window holds {available}")]
    ContextOverflow { needed: u32, available: u32 },

    #[error("Generation failed: {0}")]
    GenerationFailure(String),

    #[error("Persistence failed: {0}")]
    PersistenceFailure(#[source] StoreError),

    #[error("Engine is not initialized")]
    NotInitialized,
}

pub type Result<T> = std::result::Result<T, SessionError>;

impl SessionError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SessionError::Io {
            path: path.into(),
            source,
        }
    }

    /// Short machine-friendly name of the variant, used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::ConfigInvalid(_) => "config_invalid",
            SessionError::NotFound(_) => "not_found",
            SessionError::AlreadyRegistered(_) => "already_registered",
            SessionError::AlreadyExists(_) => "already_exists",
            SessionError::ChecksumMismatch { .. } => "checksum_mismatch",
            SessionError::Io { .. } => "io",
            SessionError::ModelLoad(_) => "model_load",
            SessionError::HistoryUnavailable(_) => "history_unavailable",
            SessionError::ContextOverflow { .. } => "context_overflow",
            SessionError::GenerationFailure(_) => "generation_failure",
            SessionError::PersistenceFailure(_) => "persistence_failure",
            SessionError::NotInitialized => "not_initialized",
        }
    }
}

impl From<StoreError> for SessionError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => SessionError::NotFound(what),
            StoreError::AlreadyExists(what) => SessionError::AlreadyExists(what),
            StoreError::Closed => SessionError::NotInitialized,
            other => SessionError::PersistenceFailure(other),
        }
    }
}

impl From<RuntimeError> for SessionError {
    fn from(e: RuntimeError) -> Self {
        match e {
            RuntimeError::ContextOverflow { needed, available } => {
                SessionError::ContextOverflow { needed, available }
            }
            RuntimeError::Engine(EngineError::ModelLoad(msg)) => SessionError::ModelLoad(msg),
            RuntimeError::Engine(EngineError::Template(msg)) => SessionError::ModelLoad(msg),
            RuntimeError::Tokenizer(e @ TokenizerError::UnknownTemplate(_)) => {
                SessionError::ModelLoad(e.to_string())
            }
            RuntimeError::NoActiveModel(kind) => {
                SessionError::ModelLoad(format!("no {kind} model is active"))
            }
            other => SessionError::GenerationFailure(other.to_string()),
        }
    }
}

impl From<SamplingError> for SessionError {
    fn from(e: SamplingError) -> Self {
        SessionError::ConfigInvalid(e.to_string())
    }
}
