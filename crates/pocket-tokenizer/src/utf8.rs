//! UTF-8 boundary handling for streamed output.
//!
//! Detokenized pieces arrive as raw bytes and a multi-byte character may be
//! split across tokens. Everything that leaves this module ends on a complete
//! code point.

/// Length of the longest prefix of `buf` that does not end inside a
/// multi-byte character.
///
/// Only the last four bytes are inspected. Malformed input is treated as
/// complete so that garbage can never stall the stream.
pub fn safe_utf8_len(buf: &[u8]) -> usize {
    let len = buf.len();
    for i in 0..len.min(4) {
        let byte = buf[len - 1 - i];
        if byte & 0x80 == 0x00 {
            return len;
        }
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let needed = if byte & 0xE0 == 0xC0 {
            1
        } else if byte & 0xF0 == 0xE0 {
            2
        } else if byte & 0xF8 == 0xF0 {
            3
        } else {
            return len;
        };
        return if i >= needed { len } else { len - 1 - i };
    }
    len
}

/// Byte accumulator that releases text only at code point boundaries.
#[derive(Debug, Clone, Default)]
pub struct Utf8StreamBuffer {
    pending: Vec<u8>,
}

impl Utf8StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    /// Drain every complete character, keeping a trailing partial one.
    pub fn take_complete(&mut self) -> String {
        let safe = safe_utf8_len(&self.pending);
        let head: Vec<u8> = self.pending.drain(..safe).collect();
        into_text(head)
    }

    /// Drain everything, including an incomplete tail.
    ///
    /// Used once generation has stopped; a tail that can no longer be
    /// completed is replaced with U+FFFD.
    pub fn finish(&mut self) -> String {
        let rest = std::mem::take(&mut self.pending);
        into_text(rest)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

fn into_text(bytes: Vec<u8>) -> String {
    match String::from_utf8(bytes) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
    }
}
