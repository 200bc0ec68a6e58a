//! Reference byte-level tokenizer.
//!
//! Every byte of the input is one token, offset past three control ids.
//! Multi-byte characters therefore span several tokens, which is exactly the
//! case streaming output must handle.

use crate::{Tokenizer, TokenizerError, TokenizerResult};

/// Byte-level tokenizer with a fixed 259-entry vocabulary.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub const PAD: i32 = 0;
    pub const BOS: i32 = 1;
    pub const EOS: i32 = 2;
    const OFFSET: i32 = 3;
    const VOCAB: usize = 256 + Self::OFFSET as usize;

    pub fn new() -> Self {
        Self
    }

    /// Token id for a single byte.
    pub fn byte_token(byte: u8) -> i32 {
        byte as i32 + Self::OFFSET
    }

    pub fn is_control(token: i32) -> bool {
        (0..Self::OFFSET).contains(&token)
    }
}

impl Tokenizer for ByteTokenizer {
    fn encode(&self, text: &str, add_bos: bool) -> TokenizerResult<Vec<i32>> {
        let mut ids = Vec::with_capacity(text.len() + add_bos as usize);
        if add_bos {
            ids.push(Self::BOS);
        }
        ids.extend(text.bytes().map(Self::byte_token));
        Ok(ids)
    }

    fn token_bytes(&self, token: i32) -> TokenizerResult<Vec<u8>> {
        if Self::is_control(token) {
            return Ok(Vec::new());
        }
        u8::try_from(token - Self::OFFSET)
            .map(|b| vec![b])
            .map_err(|_| TokenizerError::InvalidToken(token))
    }

    fn vocab_size(&self) -> usize {
        Self::VOCAB
    }
}
