//! Engine and generation configuration.
//!
//! [`EngineConfig`] is read once at startup (TOML). [`GeneratorConfig`] is
//! supplied per generation call.

use std::path::{Path, PathBuf};

use pocket_engine::{ContextParams, ModelKind};
use pocket_runtime::{RuntimeConfig, DEFAULT_FLUSH_EVERY};
use pocket_sampling::SamplerConfig;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SessionError};

fn default_llm_context_size() -> u32 {
    ContextParams::DEFAULT_LLM_CTX
}

fn default_embedding_context_size() -> u32 {
    ContextParams::DEFAULT_EMBEDDING_CTX
}

fn default_threads() -> u32 {
    ContextParams::DEFAULT_THREADS
}

fn default_flush_every() -> usize {
    DEFAULT_FLUSH_EVERY
}

/// Startup configuration for an [`Engine`](crate::Engine).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Snapshot file backing the store. `None` keeps everything in memory.
    #[serde(default)]
    pub store_path: Option<PathBuf>,
    #[serde(default = "default_llm_context_size")]
    pub llm_context_size: u32,
    #[serde(default = "default_embedding_context_size")]
    pub embedding_context_size: u32,
    #[serde(default = "default_threads")]
    pub threads: u32,
    /// Generated tokens buffered between sink calls.
    #[serde(default = "default_flush_every")]
    pub flush_every: usize,
    /// Sampler used by callers that do not bring their own.
    #[serde(default)]
    pub sampler: SamplerConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_path: None,
            llm_context_size: default_llm_context_size(),
            embedding_context_size: default_embedding_context_size(),
            threads: default_threads(),
            flush_every: default_flush_every(),
            sampler: SamplerConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SessionError::ConfigInvalid(format!("cannot read config '{}': {e}", path.display()))
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string and validate it.
    pub fn from_toml(s: &str) -> Result<Self> {
        let config: Self = toml::from_str(s)
            .map_err(|e| SessionError::ConfigInvalid(format!("config parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| SessionError::ConfigInvalid(format!("config serialize error: {e}")))
    }

    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = Some(path.into());
        self
    }

    pub fn with_llm_context_size(mut self, n_ctx: u32) -> Self {
        self.llm_context_size = n_ctx;
        self
    }

    pub fn with_flush_every(mut self, n: usize) -> Self {
        self.flush_every = n;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.llm_context_size == 0 {
            return Err(SessionError::ConfigInvalid(
                "llm_context_size must be > 0".to_string(),
            ));
        }
        if self.embedding_context_size == 0 {
            return Err(SessionError::ConfigInvalid(
                "embedding_context_size must be > 0".to_string(),
            ));
        }
        if self.threads == 0 {
            return Err(SessionError::ConfigInvalid("threads must be > 0".to_string()));
        }
        if self.flush_every == 0 {
            return Err(SessionError::ConfigInvalid("flush_every must be > 0".to_string()));
        }
        self.sampler.validate()?;
        Ok(())
    }

    /// Context parameters handed to the runtime.
    pub fn runtime_config(&self) -> RuntimeConfig {
        RuntimeConfig {
            llm_context: ContextParams::for_kind(ModelKind::Llm)
                .with_n_ctx(self.llm_context_size)
                .with_threads(self.threads),
            embedding_context: ContextParams::for_kind(ModelKind::Embedding)
                .with_n_ctx(self.embedding_context_size)
                .with_threads(self.threads),
            flush_every: self.flush_every,
        }
    }
}

/// Retrieval strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchType {
    VectorOnly,
    KeywordOnly,
    #[default]
    Hybrid,
}

/// How context is retrieved for a RAG generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Maximum chunks handed to the model.
    pub top_k: u32,
    /// Candidates fetched before reranking.
    #[serde(default)]
    pub fetch_k: u32,
    /// Minimum similarity, 0.0 to 1.0.
    #[serde(default)]
    pub score_threshold: f32,
    #[serde(default)]
    pub search_type: SearchType,
    #[serde(default)]
    pub use_reranker: bool,
    /// Neighbouring chunks pulled in around each hit.
    #[serde(default)]
    pub context_window: u32,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            fetch_k: 20,
            score_threshold: 0.0,
            search_type: SearchType::default(),
            use_reranker: false,
            context_window: 0,
        }
    }
}

impl RetrievalConfig {
    pub fn validate(&self) -> Result<()> {
        if self.top_k == 0 {
            return Err(SessionError::ConfigInvalid("retrieval top_k must be > 0".to_string()));
        }
        if !(0.0..=1.0).contains(&self.score_threshold) {
            return Err(SessionError::ConfigInvalid(format!(
                "score_threshold must be in [0, 1], got {}",
                self.score_threshold
            )));
        }
        Ok(())
    }
}

/// Where retrieval looks: a semantic space and a scope within it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorRagConfig {
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    pub semantic_space: String,
    pub scope_id: String,
}

impl GeneratorRagConfig {
    pub fn new(semantic_space: impl Into<String>, scope_id: impl Into<String>) -> Self {
        Self {
            retrieval: RetrievalConfig::default(),
            semantic_space: semantic_space.into(),
            scope_id: scope_id.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.retrieval.validate()?;
        if self.semantic_space.trim().is_empty() {
            return Err(SessionError::ConfigInvalid("semantic_space is empty".to_string()));
        }
        if self.scope_id.trim().is_empty() {
            return Err(SessionError::ConfigInvalid("scope_id is empty".to_string()));
        }
        Ok(())
    }
}

/// Whether and how a generation call retrieves context first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "rag", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RagMode {
    #[default]
    Never,
    Always(GeneratorRagConfig),
    /// Retrieval is attempted; an empty result is not a failure.
    Dynamic(GeneratorRagConfig),
}

impl RagMode {
    pub fn config(&self) -> Option<&GeneratorRagConfig> {
        match self {
            RagMode::Never => None,
            RagMode::Always(c) | RagMode::Dynamic(c) => Some(c),
        }
    }
}

/// Per-call generation settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    #[serde(default)]
    pub sampler: SamplerConfig,
    #[serde(default)]
    pub rag: RagMode,
}

impl GeneratorConfig {
    pub fn new(sampler: SamplerConfig) -> Self {
        Self {
            sampler,
            rag: RagMode::Never,
        }
    }

    pub fn with_rag(mut self, rag: RagMode) -> Self {
        self.rag = rag;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.sampler.validate()?;
        if let Some(rag) = self.rag.config() {
            rag.validate()?;
        }
        Ok(())
    }
}
