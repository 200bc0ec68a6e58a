//! # pocket-sampling
//!
//! Deterministic token selection for pocket.
//!
//! Each call narrows the vocabulary in three steps:
//! - keep the `top_k` highest logits
//! - keep the smallest nucleus whose probability mass reaches `top_p`
//! - pick the most probable survivor
//!
//! No randomness is involved, so identical logits always give the same token.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SamplingError {
    #[error("Invalid logits array")]
    InvalidLogits,

    #[error("No valid tokens after filtering")]
    NoValidTokens,

    #[error("Invalid sampler config: {0}")]
    InvalidConfig(String),
}

pub type SamplingResult<T> = std::result::Result<T, SamplingError>;

/// Per-request generation parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Most tokens one call may generate, end-of-generation excluded.
    pub max_tokens: u32,
    /// Nucleus mass in `[0, 1]`.
    pub top_p: f32,
    /// Candidates that survive the first cut.
    pub top_k: u32,
}

impl SamplerConfig {
    pub const DEFAULT_MAX_TOKENS: u32 = 512;
    pub const DEFAULT_TOP_P: f32 = 0.9;
    pub const DEFAULT_TOP_K: u32 = 50;

    pub fn with_max_tokens(mut self, n: u32) -> Self {
        self.max_tokens = n;
        self
    }

    pub fn with_top_p(mut self, p: f32) -> Self {
        self.top_p = p;
        self
    }

    pub fn with_top_k(mut self, k: u32) -> Self {
        self.top_k = k;
        self
    }

    pub fn validate(&self) -> SamplingResult<()> {
        let problem = if self.max_tokens == 0 {
            Some("max_tokens must be > 0".to_string())
        } else if !(0.0..=1.0).contains(&self.top_p) {
            Some(format!("top_p must be within [0, 1] (got {})", self.top_p))
        } else if self.top_k == 0 {
            Some("top_k must be > 0".to_string())
        } else {
            None
        };
        problem.map_or(Ok(()), |msg| Err(SamplingError::InvalidConfig(msg)))
    }
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            max_tokens: Self::DEFAULT_MAX_TOKENS,
            top_p: Self::DEFAULT_TOP_P,
            top_k: Self::DEFAULT_TOP_K,
        }
    }
}

/// One vocabulary entry still in the running.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    id: usize,
    logit: f32,
    prob: f32,
}

/// Collect the finite logits, highest first. Equal logits keep vocabulary order.
fn ranked(logits: &[f32]) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = logits
        .iter()
        .enumerate()
        .filter(|(_, l)| l.is_finite())
        .map(|(id, &logit)| Candidate {
            id,
            logit,
            prob: 0.0,
        })
        .collect();
    candidates.sort_by(|a, b| b.logit.total_cmp(&a.logit));
    candidates
}

/// Fill in `prob` relative to the remaining candidates.
fn normalize(candidates: &mut [Candidate]) {
    let Some(peak) = candidates.first().map(|c| c.logit) else {
        return;
    };
    let mut mass = 0.0;
    for c in candidates.iter_mut() {
        c.prob = (c.logit - peak).exp();
        mass += c.prob;
    }
    for c in candidates.iter_mut() {
        c.prob /= mass;
    }
}

/// Length of the shortest ranked prefix whose mass reaches `p`, at least `min_keep`.
fn nucleus_len(candidates: &[Candidate], p: f32, min_keep: usize) -> usize {
    if p >= 1.0 {
        return candidates.len();
    }
    let mut mass = 0.0;
    for (i, c) in candidates.iter().enumerate() {
        mass += c.prob;
        if mass >= p && i + 1 >= min_keep {
            return i + 1;
        }
    }
    candidates.len()
}

/// Stateful sampler holding the chain parameters.
#[derive(Debug, Clone)]
pub struct Sampler {
    pub top_k: usize,
    pub top_p: f32,
    /// Floor on how many candidates the nucleus keeps.
    pub min_keep: usize,
    accepted: usize,
}

impl Sampler {
    pub fn new() -> Self {
        Self::from_config(&SamplerConfig::default())
    }

    pub fn from_config(config: &SamplerConfig) -> Self {
        Self {
            top_k: config.top_k as usize,
            top_p: config.top_p,
            min_keep: 1,
            accepted: 0,
        }
    }

    pub fn with_top_k(mut self, k: usize) -> Self {
        self.top_k = k;
        self
    }

    pub fn with_top_p(mut self, p: f32) -> Self {
        self.top_p = p;
        self
    }

    /// Swap in a request's parameters. The accepted count carries over.
    pub fn reconfigure(&mut self, config: &SamplerConfig) {
        self.top_k = config.top_k as usize;
        self.top_p = config.top_p;
    }

    pub fn accepted(&self) -> usize {
        self.accepted
    }

    /// Choose a token id from `logits`.
    pub fn sample(&mut self, logits: &[f32]) -> SamplingResult<usize> {
        if logits.is_empty() || logits.iter().any(|l| l.is_nan()) {
            return Err(SamplingError::InvalidLogits);
        }

        let mut candidates = ranked(logits);
        if self.top_k > 0 {
            candidates.truncate(self.top_k);
        }
        normalize(&mut candidates);
        let keep = nucleus_len(&candidates, self.top_p, self.min_keep);
        candidates.truncate(keep);

        // Ranking is already by logit, so the head is the greedy pick.
        let chosen = candidates.first().ok_or(SamplingError::NoValidTokens)?;
        self.accepted += 1;
        Ok(chosen.id)
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new()
    }
}
