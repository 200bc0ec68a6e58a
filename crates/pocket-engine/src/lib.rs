//! # pocket-engine
//!
//! The "narrow waist" of the pocket stack. Defines the [`InferenceBackend`]
//! capability trait and the small set of types every other crate shares.
//! The numeric kernel (tensor math, model execution) lives behind this trait
//! and is supplied by a collaborator; everything above it (sampling, context
//! caching, streaming, persistence) is backend-agnostic.
//!
//! ## Design Notes
//!
//! ### Ownership of native handles
//! Models and contexts are associated types. A loaded model is owned by the
//! runtime's active model slot; a context is owned by exactly one cache entry.
//! Dropping either releases the underlying resources, so implementations wrap
//! their native free functions in `Drop`.
//!
//! ### Interior Mutability
//! Methods take `&self`. Mutable state that belongs to one conversation lives
//! in `Self::Context` and is passed as `&mut`, so a backend can be shared by
//! every session without synchronizing access itself.
//!
//! ### Token Type
//! `TokenId` is aliased as `i32` for FFI compatibility, though token IDs are
//! logically non-negative.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, EngineError>;

/// Token ID type (i32 for FFI compat; logically non-negative).
pub type TokenId = i32;

/// Position of a token inside a context's single sequence.
pub type SeqPos = u32;

/// Top-level error type for all backend operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Model loading failed: {0}")]
    ModelLoad(String),
    #[error("Context creation failed: {0}")]
    Context(String),
    #[error("Tokenization failed: {0}")]
    Tokenization(String),
    #[error("Decode failed: {0}")]
    Decode(String),
    #[error("Chat template unavailable: {0}")]
    Template(String),
}

/// Which active slot a model occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelKind {
    #[serde(rename = "LLM")]
    Llm,
    #[serde(rename = "EMBEDDING")]
    Embedding,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Llm => "LLM",
            ModelKind::Embedding => "EMBEDDING",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LLM" => Ok(ModelKind::Llm),
            "EMBEDDING" => Ok(ModelKind::Embedding),
            other => Err(format!("unknown model kind '{other}'")),
        }
    }
}

/// Specification for loading a model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub path: PathBuf,
    pub kind: ModelKind,
}

impl ModelSpec {
    pub fn new(path: impl Into<PathBuf>, kind: ModelKind) -> Self {
        Self {
            path: path.into(),
            kind,
        }
    }
}

/// Parameters for creating a fresh execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextParams {
    /// Context window in tokens.
    pub n_ctx: u32,
    /// Worker threads the kernel may use.
    pub n_threads: u32,
    /// Whether the context produces embeddings instead of logits.
    pub embeddings: bool,
}

impl ContextParams {
    pub const DEFAULT_LLM_CTX: u32 = 2048;
    pub const DEFAULT_EMBEDDING_CTX: u32 = 512;
    pub const DEFAULT_THREADS: u32 = 4;

    /// Defaults for a model kind: 2048 tokens for LLMs, 512 for embedders.
    pub fn for_kind(kind: ModelKind) -> Self {
        match kind {
            ModelKind::Llm => Self {
                n_ctx: Self::DEFAULT_LLM_CTX,
                n_threads: Self::DEFAULT_THREADS,
                embeddings: false,
            },
            ModelKind::Embedding => Self {
                n_ctx: Self::DEFAULT_EMBEDDING_CTX,
                n_threads: Self::DEFAULT_THREADS,
                embeddings: true,
            },
        }
    }

    pub fn with_n_ctx(mut self, n_ctx: u32) -> Self {
        self.n_ctx = n_ctx;
        self
    }

    pub fn with_threads(mut self, n_threads: u32) -> Self {
        self.n_threads = n_threads;
        self
    }
}

/// A single-sequence decode batch.
///
/// Each entry carries the token, its absolute position, and whether the
/// kernel must produce logits for it. Only the entries that will be sampled
/// from need logits; for a prompt that is the final token alone.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    tokens: Vec<TokenId>,
    positions: Vec<SeqPos>,
    logits: Vec<bool>,
}

impl Batch {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            tokens: Vec::with_capacity(n),
            positions: Vec::with_capacity(n),
            logits: Vec::with_capacity(n),
        }
    }

    /// Build a batch of consecutive positions starting at `start_pos`.
    ///
    /// Logits are requested for the last token only, and only when
    /// `logits_for_last` is set.
    pub fn from_tokens(tokens: &[TokenId], start_pos: SeqPos, logits_for_last: bool) -> Self {
        let mut batch = Self::with_capacity(tokens.len());
        for (i, &token) in tokens.iter().enumerate() {
            batch.push(token, start_pos + i as SeqPos, false);
        }
        if let Some(last) = batch.logits.last_mut() {
            *last = logits_for_last;
        }
        batch
    }

    pub fn push(&mut self, token: TokenId, pos: SeqPos, want_logits: bool) {
        self.tokens.push(token);
        self.positions.push(pos);
        self.logits.push(want_logits);
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn tokens(&self) -> &[TokenId] {
        &self.tokens
    }

    pub fn positions(&self) -> &[SeqPos] {
        &self.positions
    }

    pub fn wants_logits(&self, i: usize) -> bool {
        self.logits.get(i).copied().unwrap_or(false)
    }

    /// Number of entries that request logits.
    pub fn logit_requests(&self) -> usize {
        self.logits.iter().filter(|&&l| l).count()
    }
}

/// The inference capability everything else plugs into.
///
/// Implementations wrap a concrete kernel (llama.cpp, candle, a test double).
/// The runtime only relies on the behavior documented here:
///
/// - `decode` either applies the whole batch or leaves the context untouched.
/// - `used_positions` is one past the highest occupied position (0 when empty).
/// - `logits` returns the distribution produced for the last entry of the
///   most recent batch that requested logits.
pub trait InferenceBackend: Send + Sync {
    /// Loaded model weights and vocabulary.
    type Model: Send + Sync;
    /// Per-conversation execution state (the KV memory).
    type Context: Send;

    /// Load a model from disk.
    fn load_model(&self, spec: &ModelSpec) -> Result<Self::Model>;

    /// Create an empty context bound to `model`.
    fn new_context(&self, model: &Self::Model, params: &ContextParams) -> Result<Self::Context>;

    /// Context window size in tokens.
    fn context_size(&self, ctx: &Self::Context) -> u32;

    /// Positions already occupied in the context's sequence.
    fn used_positions(&self, ctx: &Self::Context) -> u32;

    /// Convert text into token IDs. `add_bos` is set for the first text
    /// decoded into a fresh context.
    fn tokenize(&self, model: &Self::Model, text: &str, add_bos: bool) -> Result<Vec<TokenId>>;

    /// Raw bytes of one token. May be an incomplete UTF-8 sequence.
    fn token_to_piece(&self, model: &Self::Model, token: TokenId) -> Result<Vec<u8>>;

    /// Run the model over a batch, extending the context's KV memory.
    fn decode(&self, model: &Self::Model, ctx: &mut Self::Context, batch: &Batch) -> Result<()>;

    /// Logits for the last decoded entry that requested them.
    fn logits<'a>(&self, ctx: &'a Self::Context) -> Option<&'a [f32]>;

    /// Whether `token` ends a generation turn (EOS, EOT, ...).
    fn is_end_of_generation(&self, model: &Self::Model, token: TokenId) -> bool;

    /// The chat template source embedded in the model, if any.
    fn chat_template(&self, model: &Self::Model) -> Option<String>;
}
