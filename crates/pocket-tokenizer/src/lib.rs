//! # pocket-tokenizer
//!
//! Text on either side of the backend: prompts going in, fragments coming out.
//!
//! Supports:
//! - Byte-level tokenization for tests and the scripted backend
//! - Fragment assembly that holds back incomplete UTF-8 sequences
//! - Detecting and rendering a model's chat template

pub mod byte_level;
pub mod template;
pub mod utf8;

pub use byte_level::ByteTokenizer;
pub use template::{ChatTemplate, ChatTurn};
pub use utf8::{safe_utf8_len, Utf8StreamBuffer};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TokenizerError {
    #[error("Invalid token ID: {0}")]
    InvalidToken(i32),
    #[error("Encoding error: {0}")]
    EncodingError(String),
    #[error("Decoding error: {0}")]
    DecodingError(String),
    #[error("Unrecognised chat template: {0}")]
    UnknownTemplate(String),
}

pub type TokenizerResult<T> = std::result::Result<T, TokenizerError>;

/// Maps text to token ids and back.
pub trait Tokenizer: Send + Sync {
    /// Token ids for `text`, with a leading BOS when `add_bos` is set.
    fn encode(&self, text: &str, add_bos: bool) -> TokenizerResult<Vec<i32>>;

    /// Bytes a token stands for. Control tokens have none.
    fn token_bytes(&self, token: i32) -> TokenizerResult<Vec<u8>>;

    fn vocab_size(&self) -> usize;
}
