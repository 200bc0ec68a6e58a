//! # pocket-session
//!
//! The chat-facing surface of pocket.
//!
//! Supports:
//! - **Model registry**: logical names resolved to files, with path updates
//!   gated on an XxHash64 content checksum
//! - **Chats**: creation with a seeded system prompt, history replay into a
//!   cached inference context, explicit unload
//! - **Streaming generation**: chat turns persisted atomically after the
//!   reply is streamed, plus one-shot generation that records nothing
//! - **RAG hooks**: per-call `RagMode` with retrieved context prepended to
//!   the query by a pluggable [`Retriever`]
//! - **Configuration**: [`EngineConfig`] from TOML
//!
//! ```rust,no_run
//! use std::path::Path;
//! use pocket_engine::ModelKind;
//! use pocket_runtime::ScriptedBackend;
//! use pocket_session::{Engine, EngineConfig, GeneratorConfig};
//! use pocket_store::ChatConfig;
//!
//! let engine = Engine::open(ScriptedBackend::default(), EngineConfig::default())?;
//! engine.register_model("m1", Path::new("/models/a.gguf"), ModelKind::Llm)?;
//! let chat = engine.create_chat(None, ChatConfig::new("You are helpful", "m1"))?;
//! engine.generate_streaming_chat_response(&chat, "hello", &GeneratorConfig::default(), |text| {
//!     print!("{text}");
//!     true
//! })?;
//! # Ok::<(), pocket_session::SessionError>(())
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod registry;
pub mod retrieval;

pub use config::{EngineConfig, GeneratorConfig, GeneratorRagConfig, RagMode, RetrievalConfig, SearchType};
pub use engine::{generate_chat_id, Engine};
pub use error::{Result, SessionError};
pub use registry::{checksum_file, ModelRegistry};
pub use retrieval::{compose_prompt, NoRetriever, RetrievedChunk, Retriever};
