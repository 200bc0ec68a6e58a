//! Active model slots and the per-session context cache.
//!
//! ## Locking
//! - `slots` (RwLock): generation and session loading hold it shared; a model
//!   swap holds it exclusively, so no context outlives the model it was built
//!   against.
//! - `sessions` (Mutex): guards the map only, held briefly.
//! - each session entry (Mutex): held for the whole of one generation call,
//!   so calls on the same session run one at a time.
//!
//! Lock order is always slots → sessions → entry.
//!
//! Session calls name the model the session belongs to and are refused with
//! `ModelChanged` when a different LLM is active.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use pocket_engine::{ContextParams, InferenceBackend, ModelKind, ModelSpec};
use pocket_sampling::{Sampler, SamplerConfig};
use pocket_tokenizer::{ChatTemplate, ChatTurn};
use tracing::{debug, info, warn};

use crate::generate::{GenerationOutcome, Generator, DEFAULT_FLUSH_EVERY};
use crate::telemetry::{NoopTelemetry, TelemetryHook};
use crate::{Result, RuntimeError};

/// Context sizing and flushing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub llm_context: ContextParams,
    pub embedding_context: ContextParams,
    /// Tokens buffered between sink calls.
    pub flush_every: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            llm_context: ContextParams::for_kind(ModelKind::Llm),
            embedding_context: ContextParams::for_kind(ModelKind::Embedding),
            flush_every: DEFAULT_FLUSH_EVERY,
        }
    }
}

struct ActiveModel<M> {
    path: PathBuf,
    model: M,
    template: ChatTemplate,
}

struct Slots<M> {
    llm: Option<ActiveModel<M>>,
    embedding: Option<ActiveModel<M>>,
}

impl<M> Slots<M> {
    fn get(&self, kind: ModelKind) -> Option<&ActiveModel<M>> {
        match kind {
            ModelKind::Llm => self.llm.as_ref(),
            ModelKind::Embedding => self.embedding.as_ref(),
        }
    }

    fn slot_mut(&mut self, kind: ModelKind) -> &mut Option<ActiveModel<M>> {
        match kind {
            ModelKind::Llm => &mut self.llm,
            ModelKind::Embedding => &mut self.embedding,
        }
    }
}

/// A session's cached decode state.
struct SessionContext<C> {
    context: C,
    sampler: Sampler,
}

type SessionEntry<C> = Arc<Mutex<SessionContext<C>>>;

/// The active LLM, provided it is the one at `expected`.
fn active_llm<'a, M>(slots: &'a Slots<M>, expected: &Path) -> Result<&'a ActiveModel<M>> {
    let active = slots
        .get(ModelKind::Llm)
        .ok_or(RuntimeError::NoActiveModel(ModelKind::Llm))?;
    if active.path.as_path() != expected {
        return Err(RuntimeError::ModelChanged(expected.to_path_buf()));
    }
    Ok(active)
}

/// Owns the backend, the loaded models and every cached session context.
pub struct Runtime<B: InferenceBackend> {
    backend: B,
    config: RuntimeConfig,
    slots: RwLock<Slots<B::Model>>,
    sessions: Mutex<HashMap<String, SessionEntry<B::Context>>>,
    telemetry: Arc<dyn TelemetryHook>,
}

impl<B: InferenceBackend> Runtime<B> {
    pub fn new(backend: B, config: RuntimeConfig) -> Self {
        Self {
            backend,
            config,
            slots: RwLock::new(Slots {
                llm: None,
                embedding: None,
            }),
            sessions: Mutex::new(HashMap::new()),
            telemetry: Arc::new(NoopTelemetry),
        }
    }

    pub fn with_telemetry(mut self, hook: Arc<dyn TelemetryHook>) -> Self {
        self.telemetry = hook;
        self
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Make the model at `path` the active one for `kind`.
    ///
    /// Returns `false` when it already was. Replacing the LLM evicts every
    /// cached session context. If loading fails the previous model and all
    /// contexts are kept.
    pub fn ensure_model(&self, kind: ModelKind, path: &Path) -> Result<bool> {
        if self.active_path(kind)?.as_deref() == Some(path) {
            return Ok(false);
        }

        let mut slots = self
            .slots
            .write()
            .map_err(|_| RuntimeError::Poisoned("model slots"))?;
        // Another caller may have loaded it while we waited.
        if slots.get(kind).map(|m| m.path.as_path()) == Some(path) {
            return Ok(false);
        }

        let model = self.backend.load_model(&ModelSpec::new(path, kind))?;
        let template = match kind {
            ModelKind::Llm => self.template_for(&model)?,
            ModelKind::Embedding => ChatTemplate::default(),
        };

        if kind == ModelKind::Llm {
            let evicted = self.evict_all()?;
            if evicted > 0 {
                info!(evicted, "model swap invalidated cached session contexts");
            }
        }

        let previous = slots.slot_mut(kind).replace(ActiveModel {
            path: path.to_path_buf(),
            model,
            template,
        });
        info!(
            %kind,
            path = %path.display(),
            replaced = previous.is_some(),
            "model activated"
        );
        Ok(true)
    }

    fn template_for(&self, model: &B::Model) -> Result<ChatTemplate> {
        match self.backend.chat_template(model) {
            Some(source) => Ok(ChatTemplate::detect(&source)?),
            None => {
                warn!("model has no chat template, using ChatML");
                Ok(ChatTemplate::default())
            }
        }
    }

    /// Path of the active model for `kind`.
    pub fn active_path(&self, kind: ModelKind) -> Result<Option<PathBuf>> {
        let slots = self
            .slots
            .read()
            .map_err(|_| RuntimeError::Poisoned("model slots"))?;
        Ok(slots.get(kind).map(|m| m.path.clone()))
    }

    pub fn is_loaded(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .map(|s| s.contains_key(session_id))
            .unwrap_or(false)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Drop a session's context. Returns whether one was cached.
    pub fn unload(&self, session_id: &str) -> Result<bool> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| RuntimeError::Poisoned("session cache"))?;
        Ok(sessions.remove(session_id).is_some())
    }

    fn evict_all(&self) -> Result<usize> {
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| RuntimeError::Poisoned("session cache"))?;
        let n = sessions.len();
        sessions.clear();
        Ok(n)
    }

    /// Build a session's context from its history with the active LLM.
    ///
    /// `model_path` is the model the session belongs to; if another model
    /// became active in the meantime this fails with `ModelChanged` and
    /// caches nothing. Nothing is cached unless the whole history decodes.
    /// An entry that appeared concurrently is kept.
    pub fn load_session(&self, session_id: &str, model_path: &Path, history: &[ChatTurn]) -> Result<()> {
        let slots = self
            .slots
            .read()
            .map_err(|_| RuntimeError::Poisoned("model slots"))?;
        let active = active_llm(&*slots, model_path)?;

        let mut context = self
            .backend
            .new_context(&active.model, &self.config.llm_context)?;
        let prompt = active.template.render(history, false);
        let loaded = self
            .generator(&active.model)
            .load_text(&mut context, &prompt, false)?;

        let entry = Arc::new(Mutex::new(SessionContext {
            context,
            sampler: Sampler::new(),
        }));
        let mut sessions = self
            .sessions
            .lock()
            .map_err(|_| RuntimeError::Poisoned("session cache"))?;
        sessions.entry(session_id.to_string()).or_insert(entry);
        debug!(session_id, turns = history.len(), tokens = loaded, "session context built");
        Ok(())
    }

    /// Render `turns` with a generation prompt and stream the reply into the
    /// session's cached context.
    ///
    /// Fails with `ModelChanged` when `model_path` is no longer the active
    /// LLM, and with `SessionNotLoaded` when the context was evicted.
    pub fn generate<F>(
        &self,
        session_id: &str,
        model_path: &Path,
        turns: &[ChatTurn],
        sampler: &SamplerConfig,
        sink: F,
    ) -> Result<GenerationOutcome>
    where
        F: FnMut(&str) -> bool,
    {
        let slots = self
            .slots
            .read()
            .map_err(|_| RuntimeError::Poisoned("model slots"))?;
        let active = active_llm(&*slots, model_path)?;

        let entry = {
            let sessions = self
                .sessions
                .lock()
                .map_err(|_| RuntimeError::Poisoned("session cache"))?;
            sessions
                .get(session_id)
                .cloned()
                .ok_or_else(|| RuntimeError::SessionNotLoaded(session_id.to_string()))?
        };
        let mut session = entry
            .lock()
            .map_err(|_| RuntimeError::Poisoned("session context"))?;
        let SessionContext { context, sampler: session_sampler } = &mut *session;
        session_sampler.reconfigure(sampler);

        let prompt = active.template.render(turns, true);
        let generator = self.generator(&active.model);
        generator.stream(context, session_sampler, &prompt, sampler.max_tokens, sink)
    }

    /// Generate with the LLM at `model_path` into a throwaway context that is
    /// dropped afterwards.
    pub fn generate_once<F>(
        &self,
        model_path: &Path,
        turns: &[ChatTurn],
        sampler: &SamplerConfig,
        sink: F,
    ) -> Result<GenerationOutcome>
    where
        F: FnMut(&str) -> bool,
    {
        let slots = self
            .slots
            .read()
            .map_err(|_| RuntimeError::Poisoned("model slots"))?;
        let active = active_llm(&*slots, model_path)?;

        let mut context = self
            .backend
            .new_context(&active.model, &self.config.llm_context)?;
        let mut chain = Sampler::from_config(sampler);
        let prompt = active.template.render(turns, true);
        let generator = self.generator(&active.model);
        generator.stream(&mut context, &mut chain, &prompt, sampler.max_tokens, sink)
    }

    fn generator<'a>(&'a self, model: &'a B::Model) -> Generator<'a, B> {
        Generator::new(&self.backend, model)
            .with_flush_every(self.config.flush_every)
            .with_telemetry(Arc::clone(&self.telemetry))
    }

    /// Drop every session context and both models.
    pub fn clear(&self) -> Result<()> {
        let mut slots = self
            .slots
            .write()
            .map_err(|_| RuntimeError::Poisoned("model slots"))?;
        self.evict_all()?;
        slots.llm = None;
        slots.embedding = None;
        Ok(())
    }
}
