//! On-device chat runtime.
//!
//! This crate re-exports the pocket workspace: the backend capability trait,
//! sampling, tokenization helpers, transactional storage, the runtime's
//! context cache and the session engine that ties them together.

pub use pocket_engine as engine;
pub use pocket_runtime as runtime;
pub use pocket_sampling as sampling;
pub use pocket_session as session;
pub use pocket_store as store;
pub use pocket_tokenizer as tokenizer;

pub use pocket_engine::{InferenceBackend, ModelKind};
pub use pocket_runtime::{GenerationOutcome, ScriptedBackend, StopReason};
pub use pocket_sampling::SamplerConfig;
pub use pocket_session::{Engine, EngineConfig, GeneratorConfig, GeneratorRagConfig, RagMode, SessionError};
pub use pocket_store::{ChatConfig, ChatMessage, Role, SnapshotStore, Store};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
