//! Generation telemetry.
//!
//! A [`GenerationTimer`] follows one generation call through its phases
//! (prompt load, sampling, flushes) and reports to a [`TelemetryHook`].

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Timing and volume of one generation call.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenerationMetrics {
    /// Tokens decoded from the prompt.
    pub prompt_tokens: u32,
    /// Tokens sampled, the end-of-generation token excluded.
    pub generated_tokens: u32,
    /// Fragments handed to the sink.
    pub flushes: u32,
    /// Bytes of text handed to the sink.
    pub emitted_bytes: usize,
    /// From the start of the call until the prompt was in the context.
    pub prompt_time: Duration,
    /// From prompt loaded until the call returned.
    pub sampling_time: Duration,
}

impl GenerationMetrics {
    /// Time to first token in milliseconds.
    pub fn ttft_ms(&self) -> f64 {
        self.prompt_time.as_secs_f64() * 1000.0
    }

    pub fn tokens_per_sec(&self) -> f64 {
        let secs = self.sampling_time.as_secs_f64();
        if secs > 0.0 && self.generated_tokens > 0 {
            f64::from(self.generated_tokens) / secs
        } else {
            0.0
        }
    }

    pub fn total(&self) -> Duration {
        self.prompt_time + self.sampling_time
    }
}

/// Receives generation events. Every method defaults to doing nothing.
pub trait TelemetryHook: Send + Sync {
    fn on_prompt_loaded(&self, _prompt_tokens: u32, _elapsed: Duration) {}

    fn on_flush(&self, _bytes: usize) {}

    fn on_generation_complete(&self, _metrics: &GenerationMetrics) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTelemetry;

impl TelemetryHook for NoopTelemetry {}

/// Keeps the metrics of every finished generation. Clones share the log.
#[derive(Debug, Clone, Default)]
pub struct LogTelemetry {
    runs: Arc<Mutex<Vec<GenerationMetrics>>>,
}

impl LogTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_metrics(&self) -> Option<GenerationMetrics> {
        self.runs.lock().ok().and_then(|runs| runs.last().cloned())
    }

    pub fn runs(&self) -> usize {
        self.runs.lock().map(|runs| runs.len()).unwrap_or(0)
    }
}

impl TelemetryHook for LogTelemetry {
    fn on_generation_complete(&self, metrics: &GenerationMetrics) {
        if let Ok(mut runs) = self.runs.lock() {
            runs.push(metrics.clone());
        }
    }
}

/// Reports through `tracing`: prompt loads at trace, summaries at debug.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTelemetry;

impl TelemetryHook for TracingTelemetry {
    fn on_prompt_loaded(&self, prompt_tokens: u32, elapsed: Duration) {
        tracing::trace!(prompt_tokens, elapsed_ms = elapsed.as_secs_f64() * 1000.0, "prompt loaded");
    }

    fn on_generation_complete(&self, metrics: &GenerationMetrics) {
        tracing::debug!(
            prompt_tokens = metrics.prompt_tokens,
            generated_tokens = metrics.generated_tokens,
            flushes = metrics.flushes,
            ttft_ms = metrics.ttft_ms(),
            tokens_per_sec = metrics.tokens_per_sec(),
            "generation complete"
        );
    }
}

/// Tracks one generation call.
pub struct GenerationTimer {
    hook: Arc<dyn TelemetryHook>,
    start: Instant,
    prompt_loaded: Option<Instant>,
    metrics: GenerationMetrics,
}

impl GenerationTimer {
    pub fn start(hook: Arc<dyn TelemetryHook>) -> Self {
        Self {
            hook,
            start: Instant::now(),
            prompt_loaded: None,
            metrics: GenerationMetrics::default(),
        }
    }

    pub fn prompt_loaded(&mut self, prompt_tokens: u32) {
        let now = Instant::now();
        self.prompt_loaded = Some(now);
        self.metrics.prompt_tokens = prompt_tokens;
        self.metrics.prompt_time = now.duration_since(self.start);
        self.hook.on_prompt_loaded(prompt_tokens, self.metrics.prompt_time);
    }

    pub fn record_tokens(&mut self, generated: u32) {
        self.metrics.generated_tokens = generated;
    }

    pub fn flushed(&mut self, bytes: usize) {
        self.metrics.flushes += 1;
        self.metrics.emitted_bytes += bytes;
        self.hook.on_flush(bytes);
    }

    /// Close the run and report it.
    pub fn finish(mut self) -> GenerationMetrics {
        let sampling_from = self.prompt_loaded.unwrap_or(self.start);
        self.metrics.sampling_time = sampling_from.elapsed();
        self.hook.on_generation_complete(&self.metrics);
        self.metrics
    }
}
