//! The streaming generation pipeline.
//!
//! 1. Tokenize the prompt (BOS only when the context is empty)
//! 2. Refuse prompts that do not fit the remaining window
//! 3. Decode the prompt as one batch, logits for the last token only
//! 4. Sample, append the token to the context, repeat
//! 5. Every `flush_every` tokens, detokenize and hand the complete-UTF-8
//!    prefix to the sink; a `false` from the sink stops generation

use std::sync::Arc;

use pocket_engine::{Batch, InferenceBackend, TokenId};
use pocket_sampling::Sampler;
use pocket_tokenizer::Utf8StreamBuffer;
use tracing::{debug, trace};

use crate::telemetry::{GenerationTimer, NoopTelemetry, TelemetryHook};
use crate::{Result, RuntimeError};

/// Tokens buffered between sink calls.
pub const DEFAULT_FLUSH_EVERY: usize = 20;

/// Why a generation call stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The model sampled an end-of-generation token.
    EndOfGeneration,
    /// `max_tokens` were generated.
    MaxTokens,
    /// The sink returned `false`.
    Cancelled,
    /// The context window filled up mid-generation.
    ContextFull,
}

/// Result of a generation call that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationOutcome {
    /// Generated tokens, not counting the end-of-generation token.
    pub tokens: u32,
    pub stop: StopReason,
}

/// Runs prompts through one model.
pub struct Generator<'a, B: InferenceBackend> {
    backend: &'a B,
    model: &'a B::Model,
    flush_every: usize,
    telemetry: Arc<dyn TelemetryHook>,
}

impl<'a, B: InferenceBackend> Generator<'a, B> {
    pub fn new(backend: &'a B, model: &'a B::Model) -> Self {
        Self {
            backend,
            model,
            flush_every: DEFAULT_FLUSH_EVERY,
            telemetry: Arc::new(NoopTelemetry),
        }
    }

    pub fn with_flush_every(mut self, n: usize) -> Self {
        self.flush_every = n.max(1);
        self
    }

    pub fn with_telemetry(mut self, hook: Arc<dyn TelemetryHook>) -> Self {
        self.telemetry = hook;
        self
    }

    /// Tokenize `text` and decode it into `ctx`. Returns the token count.
    ///
    /// Fails with `ContextOverflow` without touching the context when the
    /// tokens do not fit.
    pub fn load_text(&self, ctx: &mut B::Context, text: &str, want_logits: bool) -> Result<u32> {
        let is_first = self.backend.used_positions(ctx) == 0;
        let tokens = self.backend.tokenize(self.model, text, is_first)?;
        self.load_tokens(ctx, &tokens, want_logits)?;
        Ok(tokens.len() as u32)
    }

    fn load_tokens(&self, ctx: &mut B::Context, tokens: &[TokenId], want_logits: bool) -> Result<()> {
        if tokens.is_empty() {
            return Ok(());
        }
        let used = self.backend.used_positions(ctx);
        let available = self.backend.context_size(ctx);
        let needed = used as u64 + tokens.len() as u64;
        if needed > available as u64 {
            return Err(RuntimeError::ContextOverflow {
                needed: u32::try_from(needed).unwrap_or(u32::MAX),
                available,
            });
        }
        let batch = Batch::from_tokens(tokens, used, want_logits);
        self.backend.decode(self.model, ctx, &batch)?;
        Ok(())
    }

    /// Append `prompt` to `ctx` and stream up to `max_tokens` generated tokens
    /// to `sink`.
    ///
    /// Cancellation is not an error: the outcome reports how many tokens were
    /// produced before the sink declined. Text reaches the sink every
    /// `flush_every` tokens and once more at the end, so when `max_tokens`
    /// is at most `flush_every` the first fragment is the final flush and a
    /// sink that declines it still sees `tokens == max_tokens`.
    pub fn stream<F>(
        &self,
        ctx: &mut B::Context,
        sampler: &mut Sampler,
        prompt: &str,
        max_tokens: u32,
        mut sink: F,
    ) -> Result<GenerationOutcome>
    where
        F: FnMut(&str) -> bool,
    {
        let mut timer = GenerationTimer::start(Arc::clone(&self.telemetry));
        timer.prompt_loaded(self.load_text(ctx, prompt, true)?);
        let mut sink = |fragment: &str| {
            timer.flushed(fragment.len());
            sink(fragment)
        };

        let mut pending: Vec<TokenId> = Vec::with_capacity(self.flush_every);
        let mut output = Utf8StreamBuffer::new();
        let mut generated: u32 = 0;

        let stop = loop {
            if generated >= max_tokens {
                break self.final_flush(&mut pending, &mut output, &mut sink, StopReason::MaxTokens)?;
            }

            let logits = self.backend.logits(ctx).ok_or(RuntimeError::MissingLogits)?;
            let token = sampler.sample(logits)? as TokenId;
            let is_eog = self.backend.is_end_of_generation(self.model, token);

            let used = self.backend.used_positions(ctx);
            if used < self.backend.context_size(ctx) {
                let batch = Batch::from_tokens(&[token], used, true);
                self.backend.decode(self.model, ctx, &batch)?;
            } else if !is_eog {
                debug!(used, "context window full during generation");
                break self.final_flush(&mut pending, &mut output, &mut sink, StopReason::ContextFull)?;
            }

            if is_eog {
                break self.final_flush(
                    &mut pending,
                    &mut output,
                    &mut sink,
                    StopReason::EndOfGeneration,
                )?;
            }

            pending.push(token);
            generated += 1;

            if pending.len() >= self.flush_every {
                let fragment = self.detokenize(&mut pending, &mut output)?;
                if !emit(&mut sink, &fragment) {
                    break StopReason::Cancelled;
                }
            }
        };

        timer.record_tokens(generated);
        let metrics = timer.finish();
        trace!(?stop, tokens = generated, tps = metrics.tokens_per_sec(), "stream finished");
        Ok(GenerationOutcome {
            tokens: generated,
            stop,
        })
    }

    /// Move `pending` into `output` and take the complete-UTF-8 prefix.
    fn detokenize(&self, pending: &mut Vec<TokenId>, output: &mut Utf8StreamBuffer) -> Result<String> {
        for token in pending.drain(..) {
            output.push(&self.backend.token_to_piece(self.model, token)?);
        }
        Ok(output.take_complete())
    }

    fn final_flush<F>(
        &self,
        pending: &mut Vec<TokenId>,
        output: &mut Utf8StreamBuffer,
        sink: &mut F,
        reason: StopReason,
    ) -> Result<StopReason>
    where
        F: FnMut(&str) -> bool,
    {
        let mut fragment = self.detokenize(pending, output)?;
        fragment.push_str(&output.finish());
        if emit(sink, &fragment) {
            Ok(reason)
        } else {
            Ok(StopReason::Cancelled)
        }
    }
}

/// Hand a fragment to the sink. Empty fragments are not delivered.
fn emit<F>(sink: &mut F, fragment: &str) -> bool
where
    F: FnMut(&str) -> bool,
{
    fragment.is_empty() || sink(fragment)
}
