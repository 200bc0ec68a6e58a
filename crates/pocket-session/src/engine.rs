//! The session orchestrator.
//!
//! [`Engine`] ties the registry, the runtime's context cache and the store
//! together. A chat turn:
//! 1. Loads the chat's config and, for RAG modes, prepends retrieved context
//! 2. Makes the chat's model the active LLM and its context resident,
//!    replaying stored history when it is not
//! 3. Streams the reply through a shim that also accumulates it
//! 4. Persists the user/assistant pair as one transaction
//!
//! A persistence failure after generation is reported as
//! `PersistenceFailure`; the caller has already seen the streamed text but
//! the exchange is not recorded. Any failed turn drops the chat's cached
//! context, so the next turn replays exactly what the store holds.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use pocket_engine::{InferenceBackend, ModelKind};
use pocket_runtime::{GenerationOutcome, Runtime, RuntimeError, TelemetryHook};
use pocket_sampling::SamplerConfig;
use pocket_store::{in_transaction, ChatConfig, ChatMessage, NewMessage, SnapshotStore, Store, StoreError};
use pocket_tokenizer::ChatTurn;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{EngineConfig, GeneratorConfig, RagMode};
use crate::error::{Result, SessionError};
use crate::registry::ModelRegistry;
use crate::retrieval::{compose_prompt, NoRetriever, Retriever};

/// How often a turn is retried when a concurrent model swap gets between
/// loading a chat's context and using it.
const SWAP_RETRIES: usize = 3;

/// Fresh chat id: `chat_<random>_t<unix-seconds>`.
pub fn generate_chat_id() -> String {
    format!("chat_{}_t{}", Uuid::new_v4().simple(), Utc::now().timestamp())
}

/// Log a failed engine operation once, at the public boundary.
fn logged<T>(op: &'static str, result: Result<T>) -> Result<T> {
    if let Err(e) = &result {
        error!(op, kind = e.kind(), error = %e, "engine operation failed");
    }
    result
}

fn to_turn(message: &ChatMessage) -> ChatTurn {
    ChatTurn::new(message.role.as_str(), message.content.clone())
}

/// On-device chat engine over one inference backend and one store.
pub struct Engine<B: InferenceBackend> {
    config: EngineConfig,
    store: Arc<dyn Store>,
    registry: ModelRegistry,
    runtime: Runtime<B>,
    retriever: Arc<dyn Retriever>,
    running: AtomicBool,
}

impl<B: InferenceBackend> Engine<B> {
    /// Build an engine over an existing store.
    pub fn new(backend: B, store: Arc<dyn Store>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let runtime = Runtime::new(backend, config.runtime_config());
        info!(
            llm_ctx = config.llm_context_size,
            embedding_ctx = config.embedding_context_size,
            flush_every = config.flush_every,
            "engine initialized"
        );
        Ok(Self {
            registry: ModelRegistry::new(Arc::clone(&store)),
            config,
            store,
            runtime,
            retriever: Arc::new(NoRetriever),
            running: AtomicBool::new(true),
        })
    }

    /// Build an engine whose store is opened from `config.store_path`, or
    /// kept in memory when no path is set.
    pub fn open(backend: B, config: EngineConfig) -> Result<Self> {
        let store: Arc<dyn Store> = match &config.store_path {
            Some(path) => Arc::new(SnapshotStore::open(path).map_err(|e| {
                error!(path = %path.display(), error = %e, "cannot open store");
                SessionError::PersistenceFailure(e)
            })?),
            None => Arc::new(SnapshotStore::in_memory()),
        };
        Self::new(backend, store, config)
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = retriever;
        self
    }

    pub fn with_telemetry(mut self, hook: Arc<dyn TelemetryHook>) -> Self {
        self.runtime = self.runtime.with_telemetry(hook);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    pub fn runtime(&self) -> &Runtime<B> {
        &self.runtime
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    fn ensure_running(&self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SessionError::NotInitialized)
        }
    }

    // -----------------------------------------------------------------------
    // Models
    // -----------------------------------------------------------------------

    pub fn register_model(&self, name: &str, path: &Path, kind: ModelKind) -> Result<()> {
        logged("register_model", {
            self.ensure_running()
                .and_then(|()| self.registry.register(name, path, kind))
        })
    }

    pub fn update_model_path(&self, name: &str, path: &Path) -> Result<()> {
        logged("update_model_path", {
            self.ensure_running()
                .and_then(|()| self.registry.update_path(name, path))
        })
    }

    pub fn resolve_model(&self, name: &str) -> Result<PathBuf> {
        logged("resolve_model", {
            self.ensure_running().and_then(|()| self.registry.resolve(name))
        })
    }

    /// Fill the embedding slot with a registered embedding model.
    pub fn load_embedding_model(&self, name: &str) -> Result<()> {
        logged(
            "load_embedding_model",
            self.activate(name, ModelKind::Embedding).map(|_| ()),
        )
    }

    /// Resolve `name` and make it the active model of `kind`.
    fn activate(&self, name: &str, kind: ModelKind) -> Result<PathBuf> {
        self.ensure_running()?;
        let record = self.registry.record(name)?;
        if record.kind != kind {
            return Err(SessionError::ConfigInvalid(format!(
                "model '{name}' is {}, expected {kind}",
                record.kind
            )));
        }
        let path = self.registry.resolve(name)?;
        if self.runtime.ensure_model(kind, &path)? {
            debug!(name, %kind, "model swapped in");
        }
        Ok(path)
    }

    // -----------------------------------------------------------------------
    // Chats
    // -----------------------------------------------------------------------

    /// Create a chat and return its id, generating one when none is given.
    pub fn create_chat(&self, chat_id: Option<&str>, config: ChatConfig) -> Result<String> {
        logged("create_chat", self.create_chat_inner(chat_id, config))
    }

    fn create_chat_inner(&self, chat_id: Option<&str>, config: ChatConfig) -> Result<String> {
        self.ensure_running()?;
        config.validate().map_err(|e| match e {
            StoreError::Constraint(msg) => SessionError::ConfigInvalid(msg),
            other => other.into(),
        })?;

        let id = match chat_id {
            Some(id) if id.trim().is_empty() => {
                return Err(SessionError::ConfigInvalid("chat id is empty".to_string()))
            }
            Some(id) => id.to_string(),
            None => generate_chat_id(),
        };

        let model = self.registry.record(&config.model_ref)?;
        if model.kind != ModelKind::Llm {
            return Err(SessionError::ConfigInvalid(format!(
                "chat model '{}' is not an LLM",
                config.model_ref
            )));
        }

        self.store.create_chat(&id, &config)?;
        info!(chat_id = %id, model = %config.model_ref, persist = config.persist, "chat created");
        Ok(id)
    }

    /// Make the chat's context resident, rebuilding it from history if needed.
    pub fn load_chat(&self, chat_id: &str) -> Result<()> {
        logged("load_chat", {
            self.ensure_running()
                .and_then(|()| self.chat_config(chat_id))
                .and_then(|config| self.ensure_loaded(chat_id, &config))
                .map(|_| ())
        })
    }

    pub fn get_chat_history(&self, chat_id: &str) -> Result<Vec<ChatMessage>> {
        logged("get_chat_history", {
            self.ensure_running()
                .and_then(|()| Ok(self.store.get_history(chat_id)?))
        })
    }

    /// Drop the chat's cached context. Returns whether one was resident.
    pub fn unload_chat(&self, chat_id: &str) -> Result<bool> {
        logged("unload_chat", {
            self.ensure_running()
                .and_then(|()| Ok(self.runtime.unload(chat_id)?))
        })
    }

    pub fn is_chat_loaded(&self, chat_id: &str) -> bool {
        self.runtime.is_loaded(chat_id)
    }

    fn chat_config(&self, chat_id: &str) -> Result<ChatConfig> {
        self.store
            .get_chat_config(chat_id)?
            .ok_or_else(|| SessionError::NotFound(format!("chat '{chat_id}'")))
    }

    /// Activate the chat's model, then reuse or rebuild its context.
    /// Returns the path of the model the context is bound to.
    ///
    /// A cached context always belongs to the active model: swaps evict
    /// every context, and a rebuild is refused when a swap got in first.
    fn ensure_loaded(&self, chat_id: &str, config: &ChatConfig) -> Result<PathBuf> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let path = self.activate(&config.model_ref, ModelKind::Llm)?;
            if self.runtime.is_loaded(chat_id) {
                return Ok(path);
            }

            let history = self
                .store
                .get_history(chat_id)
                .map_err(|e| SessionError::HistoryUnavailable(format!("chat '{chat_id}': {e}")))?;
            let turns: Vec<ChatTurn> = history.iter().map(to_turn).collect();
            match self.runtime.load_session(chat_id, &path, &turns) {
                Ok(()) => {
                    info!(chat_id, messages = history.len(), "chat context rebuilt from history");
                    return Ok(path);
                }
                Err(RuntimeError::ModelChanged(_)) if attempt < SWAP_RETRIES => {
                    debug!(chat_id, attempt, "model swapped during rebuild, retrying");
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Generation
    // -----------------------------------------------------------------------

    /// Stream a reply to `query` in a chat and record the exchange.
    ///
    /// Returns the number of generated tokens. A sink returning `false`
    /// cancels generation; the partial reply is still recorded.
    pub fn generate_streaming_chat_response<F>(
        &self,
        chat_id: &str,
        query: &str,
        generator: &GeneratorConfig,
        mut sink: F,
    ) -> Result<u32>
    where
        F: FnMut(&str) -> bool,
    {
        logged(
            "generate_streaming_chat_response",
            self.chat_response(chat_id, query, generator, &mut sink),
        )
    }

    fn chat_response(
        &self,
        chat_id: &str,
        query: &str,
        generator: &GeneratorConfig,
        sink: &mut dyn FnMut(&str) -> bool,
    ) -> Result<u32> {
        self.ensure_running()?;
        if query.is_empty() {
            return Err(SessionError::ConfigInvalid("query is empty".to_string()));
        }
        generator.validate()?;
        let config = self.chat_config(chat_id)?;
        let prompt = self.augment(query, &generator.rag)?;

        let turns = [ChatTurn::user(prompt)];
        let mut response = String::new();
        let outcome = {
            let mut shim = |fragment: &str| {
                response.push_str(fragment);
                sink(fragment)
            };
            let mut attempt = 0;
            loop {
                attempt += 1;
                let model = self.ensure_loaded(chat_id, &config)?;
                match self
                    .runtime
                    .generate(chat_id, &model, &turns, &generator.sampler, &mut shim)
                {
                    Ok(outcome) => break outcome,
                    // A concurrent swap got in after the context was loaded.
                    // Nothing was decoded, so rebuild and go again.
                    Err(RuntimeError::SessionNotLoaded(_) | RuntimeError::ModelChanged(_))
                        if attempt < SWAP_RETRIES =>
                    {
                        debug!(chat_id, attempt, "context invalidated before generation, rebuilding");
                    }
                    Err(e) => {
                        // The context may hold a turn that will never be
                        // stored. Drop it so the next turn replays history.
                        self.discard_context(chat_id);
                        return Err(e.into());
                    }
                }
            }
        };
        self.report(chat_id, &outcome);

        if config.persist {
            if let Err(e) = self.persist_exchange(chat_id, query, response) {
                self.discard_context(chat_id);
                return Err(e);
            }
        }
        Ok(outcome.tokens)
    }

    /// Forget a chat's cached context after a failed turn.
    fn discard_context(&self, chat_id: &str) {
        match self.runtime.unload(chat_id) {
            Ok(true) => debug!(chat_id, "context dropped after failed turn"),
            Ok(false) => {}
            Err(e) => warn!(chat_id, error = %e, "could not drop context after failed turn"),
        }
    }

    /// Stream a reply to a standalone `query` with the named model. Nothing
    /// is cached or recorded.
    pub fn generate_streaming_response<F>(
        &self,
        model_name: &str,
        query: &str,
        sampler: &SamplerConfig,
        mut sink: F,
    ) -> Result<u32>
    where
        F: FnMut(&str) -> bool,
    {
        logged("generate_streaming_response", {
            self.one_shot(model_name, query, sampler, &mut sink)
        })
    }

    fn one_shot(
        &self,
        model_name: &str,
        query: &str,
        sampler: &SamplerConfig,
        sink: &mut dyn FnMut(&str) -> bool,
    ) -> Result<u32> {
        self.ensure_running()?;
        if query.is_empty() {
            return Err(SessionError::ConfigInvalid("query is empty".to_string()));
        }
        sampler.validate()?;
        let turns = [ChatTurn::user(query)];
        let mut attempt = 0;
        let outcome = loop {
            attempt += 1;
            let model = self.activate(model_name, ModelKind::Llm)?;
            match self.runtime.generate_once(&model, &turns, sampler, &mut *sink) {
                Err(RuntimeError::ModelChanged(_)) if attempt < SWAP_RETRIES => {
                    debug!(model = model_name, attempt, "model swapped before generation, retrying");
                }
                other => break other?,
            }
        };
        debug!(model = model_name, tokens = outcome.tokens, stop = ?outcome.stop, "one-shot generation finished");
        Ok(outcome.tokens)
    }

    /// Prepend retrieved context to `query` according to the RAG mode.
    ///
    /// `Always` propagates retrieval failures; `Dynamic` falls back to the
    /// bare query.
    fn augment(&self, query: &str, rag: &RagMode) -> Result<String> {
        match rag {
            RagMode::Never => Ok(query.to_string()),
            RagMode::Always(rag) => {
                let chunks = self.retriever.retrieve(query, rag)?;
                Ok(compose_prompt(query, chunks, &rag.retrieval))
            }
            RagMode::Dynamic(rag) => match self.retriever.retrieve(query, rag) {
                Ok(chunks) => Ok(compose_prompt(query, chunks, &rag.retrieval)),
                Err(e) => {
                    warn!(scope = %rag.scope_id, error = %e, "retrieval failed, answering without context");
                    Ok(query.to_string())
                }
            },
        }
    }

    fn report(&self, chat_id: &str, outcome: &GenerationOutcome) {
        info!(chat_id, tokens = outcome.tokens, stop = ?outcome.stop, "chat response generated");
    }

    /// Write the user and assistant messages as one unit of work.
    fn persist_exchange(&self, chat_id: &str, query: &str, response: String) -> Result<()> {
        let messages = vec![NewMessage::user(query), NewMessage::assistant(response)];
        in_transaction(self.store.as_ref(), |store| store.insert_messages(chat_id, messages))
            .map_err(SessionError::PersistenceFailure)?;
        debug!(chat_id, "exchange persisted");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Release every context and model and close the store. Later calls fail
    /// with `NotInitialized`.
    pub fn shutdown(&self) -> Result<()> {
        logged("shutdown", self.shutdown_inner())
    }

    fn shutdown_inner(&self) -> Result<()> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(SessionError::NotInitialized);
        }
        let sessions = self.runtime.session_count();
        self.runtime.clear()?;
        self.store.close().map_err(SessionError::PersistenceFailure)?;
        info!(sessions, "engine shut down");
        Ok(())
    }
}
