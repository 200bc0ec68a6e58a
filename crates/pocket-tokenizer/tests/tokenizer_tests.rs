//! Integration tests for pocket-tokenizer.
//!
//! Validates:
//! - Bit-perfect roundtrip of token bytes across scripts
//! - Streaming decode never emits a torn code point
//! - Streamed fragments concatenate back to the input
//! - Template rendering feeds cleanly into the tokenizer
//! - Thread safety (shared tokenizer across threads)

use pocket_tokenizer::*;
use std::sync::Arc;

/// Concatenate the bytes of `ids` into text.
fn text_of(tok: &dyn Tokenizer, ids: &[i32]) -> String {
    let mut bytes = Vec::new();
    for &id in ids {
        bytes.extend(tok.token_bytes(id).unwrap());
    }
    String::from_utf8(bytes).unwrap()
}

const SAMPLES: &[&str] = &[
    "hello world",
    "naïve café",
    "日本語のテキスト",
    "emoji 🦙🚀 mix",
    "Ελληνικά and русский",
    "",
    "tabs\tand\nnewlines",
];

// ===========================================================================
// Roundtrip
// ===========================================================================

#[test]
fn roundtrip_preserves_every_sample() {
    let tok = ByteTokenizer::new();
    for input in SAMPLES {
        let encoded = tok.encode(input, true).unwrap();
        let decoded = text_of(&tok, &encoded);
        assert_eq!(&decoded, input, "roundtrip failed for: {:?}", input);
    }
}

#[test]
fn bos_only_prefixes_when_requested() {
    let tok = ByteTokenizer::new();
    let with = tok.encode("ab", true).unwrap();
    let without = tok.encode("ab", false).unwrap();
    assert_eq!(with.len(), without.len() + 1);
    assert_eq!(with[0], ByteTokenizer::BOS);
    assert_eq!(&with[1..], &without[..]);
}

// ===========================================================================
// Streaming
// ===========================================================================

#[test]
fn streaming_fragments_never_end_mid_codepoint() {
    let tok = ByteTokenizer::new();
    for input in SAMPLES {
        let mut buf = Utf8StreamBuffer::new();
        let mut out = String::new();
        for id in tok.encode(input, false).unwrap() {
            buf.push(&tok.token_bytes(id).unwrap());
            let fragment = buf.take_complete();
            // A String is always valid UTF-8; check nothing was replaced.
            assert!(!fragment.contains('\u{FFFD}'), "torn output for {:?}", input);
            out.push_str(&fragment);
        }
        out.push_str(&buf.finish());
        assert_eq!(&out, input);
    }
}

#[test]
fn chunked_pushes_reassemble() {
    let text = "ünïcödé ✓ 🦙";
    let bytes = text.as_bytes();
    for chunk in 1..=5 {
        let mut buf = Utf8StreamBuffer::new();
        let mut out = String::new();
        for piece in bytes.chunks(chunk) {
            buf.push(piece);
            let fragment = buf.take_complete();
            assert!(!fragment.contains('\u{FFFD}'));
            out.push_str(&fragment);
        }
        assert!(buf.is_empty(), "chunk size {chunk} left bytes behind");
        assert_eq!(out, text);
    }
}

#[test]
fn safe_len_is_a_char_boundary() {
    for input in SAMPLES {
        let bytes = input.as_bytes();
        for cut in 0..=bytes.len() {
            let safe = safe_utf8_len(&bytes[..cut]);
            assert!(safe <= cut);
            assert!(input.is_char_boundary(safe), "{:?} cut {cut}", input);
            assert!(cut - safe < 4);
        }
    }
}

// ===========================================================================
// Templates
// ===========================================================================

#[test]
fn rendered_prompt_roundtrips_through_tokenizer() {
    let tok = ByteTokenizer::new();
    let turns = vec![
        ChatTurn::system("You are helpful"),
        ChatTurn::user("¿qué tal?"),
    ];
    for template in [ChatTemplate::ChatMl, ChatTemplate::Llama3, ChatTemplate::Zephyr] {
        let prompt = template.render(&turns, true);
        assert!(prompt.contains("¿qué tal?"));
        let ids = tok.encode(&prompt, true).unwrap();
        assert_eq!(text_of(&tok, &ids), prompt);
    }
}

#[test]
fn detection_matches_rendered_output() {
    for template in [ChatTemplate::ChatMl, ChatTemplate::Llama3, ChatTemplate::Zephyr] {
        let rendered = template.render(&[ChatTurn::user("x")], true);
        assert_eq!(ChatTemplate::detect(&rendered).unwrap(), template);
    }
}

// ===========================================================================
// Thread Safety
// ===========================================================================

#[test]
fn shared_tokenizer_across_threads() {
    let tok: Arc<dyn Tokenizer> = Arc::new(ByteTokenizer::new());
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let tok = Arc::clone(&tok);
            std::thread::spawn(move || {
                let text = format!("thread {i} → ok");
                let ids = tok.encode(&text, false).unwrap();
                (text, text_of(tok.as_ref(), &ids))
            })
        })
        .collect();
    for h in handles {
        let (input, output) = h.join().unwrap();
        assert_eq!(input, output);
    }
}

#[test]
fn invalid_token_surfaces_error() {
    let tok = ByteTokenizer::new();
    assert_eq!(
        tok.token_bytes(10_000).unwrap_err(),
        TokenizerError::InvalidToken(10_000)
    );
}
