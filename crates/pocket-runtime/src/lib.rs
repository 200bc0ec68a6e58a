//! # pocket-runtime
//!
//! Execution layer for pocket. Owns the loaded models and every chat
//! session's inference context, and drives token generation over them.
//!
//! Supports:
//! - **Active model slots**: one loaded model per [`ModelKind`]; swapping the
//!   LLM evicts every cached session context
//! - **Context cache**: per-session context + sampler, rebuilt from history
//!   on demand
//! - **Streaming generation**: prompt loading with overflow checks, greedy
//!   top-k/top-p sampling, UTF-8-safe fragment flushing, cooperative
//!   cancellation
//! - **Telemetry**: TTFT and throughput via [`TelemetryHook`]
//! - **Reference backend**: [`ScriptedBackend`], a deterministic
//!   byte-level stand-in for a real kernel
//!
//! [`ModelKind`]: pocket_engine::ModelKind

pub mod cache;
pub mod generate;
pub mod scripted;
pub mod telemetry;

pub use cache::{Runtime, RuntimeConfig};
pub use generate::{GenerationOutcome, Generator, StopReason, DEFAULT_FLUSH_EVERY};
pub use scripted::ScriptedBackend;
pub use telemetry::{
    GenerationMetrics, GenerationTimer, LogTelemetry, NoopTelemetry, TelemetryHook,
    TracingTelemetry,
};

use std::path::PathBuf;

use pocket_engine::{EngineError, ModelKind};
use pocket_sampling::SamplingError;
use pocket_tokenizer::TokenizerError;

/// Error type for runtime operations.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("Sampling failed: {0}")]
    Sampling(#[from] SamplingError),
    #[error(transparent)]
    Tokenizer(#[from] TokenizerError),
    #[error("Context overflow: {needed} tokens needed, window holds {available}")]
    ContextOverflow { needed: u32, available: u32 },
    #[error("No {0} model is active")]
    NoActiveModel(ModelKind),
    #[error("Session '{0}' has no loaded context")]
    SessionNotLoaded(String),
    #[error("Active model is no longer {}", .0.display())]
    ModelChanged(PathBuf),
    #[error("Backend produced no logits to sample from")]
    MissingLogits,
    #[error("Runtime lock poisoned: {0}")]
    Poisoned(&'static str),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
