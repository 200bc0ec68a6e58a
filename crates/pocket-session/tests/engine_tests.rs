//! Session engine tests over the scripted backend.
//!
//! Validates:
//! - Register → create → generate → history, end to end
//! - Path updates are gated on content checksum
//! - Chat creation rejects duplicates, unknown models and bad configs
//! - Swapping the chat model invalidates other chats' contexts
//! - Oversized history caches nothing
//! - Cancellation returns a partial count and still records the exchange
//! - A failed write after generation is `PersistenceFailure`
//! - A failed turn leaves no trace in the cached context
//! - A model swap racing a rebuild never binds a chat to the wrong model
//! - Shutdown makes every later call fail with `NotInitialized`

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Mutex};

use pocket_engine::ModelKind;
use pocket_runtime::{LogTelemetry, ScriptedBackend};
use pocket_sampling::SamplerConfig;
use pocket_session::*;
use pocket_store::{ChatConfig, ChatMessage, ModelRecord, Role, SnapshotStore, Store};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Files {
    dir: tempfile::TempDir,
}

impl Files {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn model(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(bytes).unwrap();
        path
    }
}

fn engine(backend: ScriptedBackend) -> Engine<ScriptedBackend> {
    Engine::new(
        backend,
        Arc::new(SnapshotStore::in_memory()),
        EngineConfig::default(),
    )
    .unwrap()
}

fn with_model(files: &Files, backend: ScriptedBackend) -> Engine<ScriptedBackend> {
    let engine = engine(backend);
    engine
        .register_model("m1", &files.model("a.gguf", b"weights a"), ModelKind::Llm)
        .unwrap();
    engine
}

fn chat_config() -> ChatConfig {
    ChatConfig::new("You are helpful", "m1")
}

fn generator(max_tokens: u32) -> GeneratorConfig {
    GeneratorConfig::new(SamplerConfig::default().with_max_tokens(max_tokens))
}

fn ask(engine: &Engine<ScriptedBackend>, chat: &str, query: &str) -> (Result<u32>, String) {
    let mut text = String::new();
    let result = engine.generate_streaming_chat_response(chat, query, &generator(50), |f| {
        text.push_str(f);
        true
    });
    (result, text)
}

// ---------------------------------------------------------------------------
// End to end
// ---------------------------------------------------------------------------

#[test]
fn register_create_generate_history() {
    let files = Files::new();
    let engine = with_model(&files, ScriptedBackend::default());

    let chat = engine.create_chat(None, chat_config()).unwrap();
    assert!(chat.starts_with("chat_"));
    assert!(chat.contains("_t"));

    let (tokens, text) = ask(&engine, &chat, "hello");
    assert_eq!(tokens.unwrap(), 18);
    assert_eq!(text, "Hello from pocket.");

    let history = engine.get_chat_history(&chat).unwrap();
    let roles: Vec<Role> = history.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
    assert_eq!(history[0].content, "You are helpful");
    assert_eq!(history[1].content, "hello");
    assert_eq!(history[2].content, "Hello from pocket.");
    let seqs: Vec<u64> = history.iter().map(|m| m.sequence_index).collect();
    assert_eq!(seqs, vec![0, 1, 2]);
    assert!(engine.is_chat_loaded(&chat));
}

#[test]
fn turns_keep_sequence_gap_free() {
    let files = Files::new();
    let engine = with_model(&files, ScriptedBackend::new("ok"));
    let chat = engine.create_chat(Some("c1"), chat_config()).unwrap();
    assert_eq!(chat, "c1");

    ask(&engine, "c1", "one").0.unwrap();
    ask(&engine, "c1", "two").0.unwrap();
    let seqs: Vec<u64> = engine
        .get_chat_history("c1")
        .unwrap()
        .iter()
        .map(|m| m.sequence_index)
        .collect();
    assert_eq!(seqs, vec![0, 1, 2, 3, 4]);
    // The second turn reused the cached context.
    assert_eq!(engine.runtime().backend().contexts_created(), 1);
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

#[test]
fn checksum_gate_on_path_update() {
    let files = Files::new();
    let engine = with_model(&files, ScriptedBackend::default());

    let moved = files.model("moved.gguf", b"weights a");
    let other = files.model("other.gguf", b"weights b");

    let err = engine.update_model_path("m1", &other).unwrap_err();
    assert!(matches!(err, SessionError::ChecksumMismatch { .. }));
    assert_ne!(engine.resolve_model("m1").unwrap(), other);

    engine.update_model_path("m1", &moved).unwrap();
    assert_eq!(engine.resolve_model("m1").unwrap(), moved);
}

#[test]
fn registering_a_missing_file_fails() {
    let files = Files::new();
    let engine = engine(ScriptedBackend::default());
    let err = engine
        .register_model("m1", &files.dir.path().join("nope.gguf"), ModelKind::Llm)
        .unwrap_err();
    assert!(matches!(err, SessionError::Io { .. }));
    assert!(matches!(
        engine.resolve_model("m1").unwrap_err(),
        SessionError::NotFound(_)
    ));
}

#[test]
fn embedding_models_fill_their_own_slot() {
    let files = Files::new();
    let engine = with_model(&files, ScriptedBackend::default());
    let embedder = files.model("e.gguf", b"embedder");
    engine
        .register_model("e1", &embedder, ModelKind::Embedding)
        .unwrap();

    engine.load_embedding_model("e1").unwrap();
    assert_eq!(
        engine.runtime().active_path(ModelKind::Embedding).unwrap(),
        Some(embedder)
    );
    assert!(matches!(
        engine.load_embedding_model("m1").unwrap_err(),
        SessionError::ConfigInvalid(_)
    ));
}

// ---------------------------------------------------------------------------
// Chat creation
// ---------------------------------------------------------------------------

#[test]
fn create_chat_validation() {
    let files = Files::new();
    let engine = with_model(&files, ScriptedBackend::default());
    engine
        .register_model("e1", &files.model("e.gguf", b"embedder"), ModelKind::Embedding)
        .unwrap();

    engine.create_chat(Some("dup"), chat_config()).unwrap();
    assert!(matches!(
        engine.create_chat(Some("dup"), chat_config()).unwrap_err(),
        SessionError::AlreadyExists(_)
    ));
    assert!(matches!(
        engine
            .create_chat(None, ChatConfig::new("hi", "ghost"))
            .unwrap_err(),
        SessionError::NotFound(_)
    ));
    assert!(matches!(
        engine.create_chat(None, ChatConfig::new("  ", "m1")).unwrap_err(),
        SessionError::ConfigInvalid(_)
    ));
    assert!(matches!(
        engine.create_chat(None, ChatConfig::new("hi", "e1")).unwrap_err(),
        SessionError::ConfigInvalid(_)
    ));
    assert!(matches!(
        engine.create_chat(Some(""), chat_config()).unwrap_err(),
        SessionError::ConfigInvalid(_)
    ));
}

#[test]
fn generated_ids_are_unique() {
    let a = generate_chat_id();
    let b = generate_chat_id();
    assert_ne!(a, b);
}

#[test]
fn unknown_chat_is_not_found() {
    let files = Files::new();
    let engine = with_model(&files, ScriptedBackend::default());
    assert!(matches!(
        ask(&engine, "ghost", "hi").0.unwrap_err(),
        SessionError::NotFound(_)
    ));
    assert!(matches!(
        engine.get_chat_history("ghost").unwrap_err(),
        SessionError::NotFound(_)
    ));
    assert!(matches!(
        engine.load_chat("ghost").unwrap_err(),
        SessionError::NotFound(_)
    ));
}

#[test]
fn empty_query_is_rejected() {
    let files = Files::new();
    let engine = with_model(&files, ScriptedBackend::default());
    let chat = engine.create_chat(None, chat_config()).unwrap();
    assert!(matches!(
        ask(&engine, &chat, "").0.unwrap_err(),
        SessionError::ConfigInvalid(_)
    ));
    assert_eq!(engine.get_chat_history(&chat).unwrap().len(), 1);
}

// ---------------------------------------------------------------------------
// Context cache
// ---------------------------------------------------------------------------

#[test]
fn model_swap_invalidates_other_chats() {
    let files = Files::new();
    let engine = with_model(&files, ScriptedBackend::default());
    engine
        .register_model("m2", &files.model("b.gguf", b"weights b"), ModelKind::Llm)
        .unwrap();
    let a = engine.create_chat(Some("a"), chat_config()).unwrap();
    let b = engine
        .create_chat(Some("b"), ChatConfig::new("You are terse", "m2"))
        .unwrap();

    engine.load_chat(&a).unwrap();
    assert!(engine.is_chat_loaded(&a));

    engine.load_chat(&b).unwrap();
    assert!(engine.is_chat_loaded(&b));
    assert!(!engine.is_chat_loaded(&a));

    let before = engine.runtime().backend().contexts_created();
    engine.load_chat(&a).unwrap();
    assert!(engine.is_chat_loaded(&a));
    assert!(!engine.is_chat_loaded(&b));
    assert_eq!(engine.runtime().backend().contexts_created(), before + 1);
    assert_eq!(engine.runtime().backend().models_loaded(), 3);
}

#[test]
fn oversized_history_is_context_overflow() {
    let files = Files::new();
    let engine = Engine::new(
        ScriptedBackend::default(),
        Arc::new(SnapshotStore::in_memory()),
        EngineConfig::default().with_llm_context_size(32),
    )
    .unwrap();
    engine
        .register_model("m1", &files.model("a.gguf", b"w"), ModelKind::Llm)
        .unwrap();
    let chat = engine
        .create_chat(None, ChatConfig::new("x".repeat(100), "m1"))
        .unwrap();

    let err = engine.load_chat(&chat).unwrap_err();
    assert!(matches!(err, SessionError::ContextOverflow { available: 32, .. }));
    assert!(!engine.is_chat_loaded(&chat));
}

#[test]
fn unload_is_idempotent() {
    let files = Files::new();
    let engine = with_model(&files, ScriptedBackend::default());
    let chat = engine.create_chat(None, chat_config()).unwrap();
    engine.load_chat(&chat).unwrap();

    assert!(engine.unload_chat(&chat).unwrap());
    assert!(!engine.unload_chat(&chat).unwrap());
    assert!(!engine.is_chat_loaded(&chat));

    // The next turn rebuilds from history.
    ask(&engine, &chat, "back").0.unwrap();
    assert!(engine.is_chat_loaded(&chat));
}

#[test]
fn missing_model_file_is_model_load_error() {
    let files = Files::new();
    let engine = engine(ScriptedBackend::default());
    let path = files.model("a.gguf", b"w");
    engine.register_model("m1", &path, ModelKind::Llm).unwrap();
    let chat = engine.create_chat(None, chat_config()).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert!(matches!(
        engine.load_chat(&chat).unwrap_err(),
        SessionError::ModelLoad(_)
    ));
}

// ---------------------------------------------------------------------------
// Generation
// ---------------------------------------------------------------------------

#[test]
fn cancellation_returns_partial_count_and_records_it() {
    let files = Files::new();
    let engine = with_model(&files, ScriptedBackend::new(&"x".repeat(100)));
    let chat = engine.create_chat(None, chat_config()).unwrap();

    let mut calls = 0;
    let tokens = engine
        .generate_streaming_chat_response(&chat, "go", &generator(50), |_| {
            calls += 1;
            false
        })
        .unwrap();
    assert_eq!(calls, 1);
    assert!(tokens < 50);
    assert_eq!(tokens, 20);

    let history = engine.get_chat_history(&chat).unwrap();
    assert_eq!(history.len(), 3);
    assert_eq!(history[2].content, "x".repeat(20));
}

#[test]
fn ephemeral_chats_record_nothing_but_the_seed() {
    let files = Files::new();
    let engine = with_model(&files, ScriptedBackend::new("ok"));
    let chat = engine
        .create_chat(None, chat_config().with_persist(false))
        .unwrap();

    let (tokens, text) = ask(&engine, &chat, "hi");
    assert_eq!(tokens.unwrap(), 2);
    assert_eq!(text, "ok");
    assert_eq!(engine.get_chat_history(&chat).unwrap().len(), 1);
    assert!(engine.is_chat_loaded(&chat));
}

#[test]
fn failed_write_after_generation_is_persistence_failure() {
    let files = Files::new();
    let parent = files.dir.path().join("state");
    let config = EngineConfig::default().with_store_path(parent.join("pocket.json"));
    let engine = Engine::open(ScriptedBackend::new("streamed"), config).unwrap();
    engine
        .register_model("m1", &files.model("a.gguf", b"w"), ModelKind::Llm)
        .unwrap();
    let chat = engine.create_chat(None, chat_config()).unwrap();

    // Replace the store directory with a plain file so the next write fails.
    std::fs::remove_dir_all(&parent).unwrap();
    std::fs::write(&parent, b"not a directory").unwrap();

    let (result, text) = ask(&engine, &chat, "hi");
    assert!(matches!(result.unwrap_err(), SessionError::PersistenceFailure(_)));
    // The caller saw the reply, but the exchange was not recorded.
    assert_eq!(text, "streamed");
    assert_eq!(engine.get_chat_history(&chat).unwrap().len(), 1);
    assert_eq!(engine.store().transaction_depth(), 0);
    // The unrecorded exchange must not linger in the cached context.
    assert!(!engine.is_chat_loaded(&chat));
}

#[test]
fn failed_generation_drops_the_context() {
    let files = Files::new();
    let engine = with_model(&files, ScriptedBackend::new("ok"));
    let chat = engine.create_chat(None, chat_config()).unwrap();
    engine.load_chat(&chat).unwrap();

    let backend = engine.runtime().backend();
    backend.set_fail_sampled_decodes(true);
    let (result, _) = ask(&engine, &chat, "lost turn");
    assert!(matches!(result, Err(SessionError::GenerationFailure(_))));
    assert!(!engine.is_chat_loaded(&chat));
    assert_eq!(engine.get_chat_history(&chat).unwrap().len(), 1);

    // The next turn replays the stored history, not the failed turn.
    backend.set_fail_sampled_decodes(false);
    let contexts = backend.contexts_created();
    let (result, text) = ask(&engine, &chat, "second");
    assert_eq!(result.unwrap(), 2);
    assert_eq!(text, "ok");
    assert_eq!(backend.contexts_created(), contexts + 1);
    let contents: Vec<String> = engine
        .get_chat_history(&chat)
        .unwrap()
        .into_iter()
        .map(|m| m.content)
        .collect();
    assert_eq!(contents, vec!["You are helpful", "second", "ok"]);
}

#[test]
fn one_shot_generation_caches_and_records_nothing() {
    let files = Files::new();
    let engine = with_model(&files, ScriptedBackend::new("yo"));

    let mut text = String::new();
    let tokens = engine
        .generate_streaming_response("m1", "hi", &SamplerConfig::default(), |f| {
            text.push_str(f);
            true
        })
        .unwrap();
    assert_eq!(tokens, 2);
    assert_eq!(text, "yo");
    assert_eq!(engine.runtime().session_count(), 0);

    assert!(matches!(
        engine
            .generate_streaming_response("ghost", "hi", &SamplerConfig::default(), |_| true)
            .unwrap_err(),
        SessionError::NotFound(_)
    ));
}

#[test]
fn invalid_sampler_is_config_invalid() {
    let files = Files::new();
    let engine = with_model(&files, ScriptedBackend::default());
    let chat = engine.create_chat(None, chat_config()).unwrap();
    let bad = GeneratorConfig::new(SamplerConfig::default().with_top_p(2.0));
    assert!(matches!(
        engine
            .generate_streaming_chat_response(&chat, "hi", &bad, |_| true)
            .unwrap_err(),
        SessionError::ConfigInvalid(_)
    ));
}

#[test]
fn telemetry_sees_chat_generation() {
    let files = Files::new();
    let log = LogTelemetry::new();
    let engine = with_model(&files, ScriptedBackend::new("abc")).with_telemetry(Arc::new(log.clone()));
    let chat = engine.create_chat(None, chat_config()).unwrap();
    ask(&engine, &chat, "hi").0.unwrap();
    assert_eq!(log.last_metrics().unwrap().generated_tokens, 3);
}

// ---------------------------------------------------------------------------
// Retrieval
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingRetriever {
    scopes: Mutex<Vec<String>>,
}

impl Retriever for RecordingRetriever {
    fn retrieve(&self, _query: &str, rag: &GeneratorRagConfig) -> Result<Vec<RetrievedChunk>> {
        self.scopes.lock().unwrap().push(rag.scope_id.clone());
        Ok(vec![RetrievedChunk::new("The sky is blue.", 0.8)])
    }
}

struct FailingRetriever;

impl Retriever for FailingRetriever {
    fn retrieve(&self, _query: &str, _rag: &GeneratorRagConfig) -> Result<Vec<RetrievedChunk>> {
        Err(SessionError::GenerationFailure("index offline".to_string()))
    }
}

#[test]
fn rag_context_is_retrieved_but_query_is_recorded() {
    let files = Files::new();
    let retriever = Arc::new(RecordingRetriever::default());
    let engine = with_model(&files, ScriptedBackend::new("blue"))
        .with_retriever(Arc::clone(&retriever) as Arc<dyn Retriever>);
    let chat = engine.create_chat(None, chat_config()).unwrap();

    let config = generator(50).with_rag(RagMode::Always(GeneratorRagConfig::new("docs", "user_1")));
    let tokens = engine
        .generate_streaming_chat_response(&chat, "what colour?", &config, |_| true)
        .unwrap();
    assert_eq!(tokens, 4);
    assert_eq!(*retriever.scopes.lock().unwrap(), vec!["user_1".to_string()]);
    assert_eq!(engine.get_chat_history(&chat).unwrap()[1].content, "what colour?");
}

#[test]
fn rag_requires_a_scope() {
    let files = Files::new();
    let engine = with_model(&files, ScriptedBackend::default());
    let chat = engine.create_chat(None, chat_config()).unwrap();
    let config = generator(50).with_rag(RagMode::Always(GeneratorRagConfig::new("docs", "")));
    assert!(matches!(
        engine
            .generate_streaming_chat_response(&chat, "hi", &config, |_| true)
            .unwrap_err(),
        SessionError::ConfigInvalid(_)
    ));
}

#[test]
fn dynamic_rag_survives_retrieval_failure() {
    let files = Files::new();
    let engine = with_model(&files, ScriptedBackend::new("ok")).with_retriever(Arc::new(FailingRetriever));
    let chat = engine.create_chat(None, chat_config()).unwrap();
    let rag = GeneratorRagConfig::new("docs", "scope");

    let dynamic = generator(50).with_rag(RagMode::Dynamic(rag.clone()));
    assert_eq!(
        engine
            .generate_streaming_chat_response(&chat, "hi", &dynamic, |_| true)
            .unwrap(),
        2
    );

    let always = generator(50).with_rag(RagMode::Always(rag));
    assert!(engine
        .generate_streaming_chat_response(&chat, "hi", &always, |_| true)
        .is_err());
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[test]
fn history_survives_reopen() {
    let files = Files::new();
    let store_path = files.dir.path().join("pocket.json");
    let model = files.model("a.gguf", b"w");

    let chat = {
        let engine = Engine::open(
            ScriptedBackend::new("hi there"),
            EngineConfig::default().with_store_path(&store_path),
        )
        .unwrap();
        engine.register_model("m1", &model, ModelKind::Llm).unwrap();
        let chat = engine.create_chat(None, chat_config()).unwrap();
        ask(&engine, &chat, "hello").0.unwrap();
        engine.shutdown().unwrap();
        chat
    };

    let engine = Engine::open(
        ScriptedBackend::new("hi there"),
        EngineConfig::default().with_store_path(&store_path),
    )
    .unwrap();
    assert_eq!(engine.resolve_model("m1").unwrap(), model);
    assert_eq!(engine.get_chat_history(&chat).unwrap().len(), 3);
    assert!(!engine.is_chat_loaded(&chat));
    engine.load_chat(&chat).unwrap();
    assert!(engine.is_chat_loaded(&chat));
}

#[test]
fn shutdown_makes_engine_unusable() {
    let files = Files::new();
    let engine = with_model(&files, ScriptedBackend::default());
    let chat = engine.create_chat(None, chat_config()).unwrap();
    engine.load_chat(&chat).unwrap();

    engine.shutdown().unwrap();
    assert!(!engine.is_chat_loaded(&chat));
    assert!(matches!(
        ask(&engine, &chat, "hi").0.unwrap_err(),
        SessionError::NotInitialized
    ));
    assert!(matches!(
        engine.resolve_model("m1").unwrap_err(),
        SessionError::NotInitialized
    ));
    assert!(matches!(
        engine.shutdown().unwrap_err(),
        SessionError::NotInitialized
    ));
}

#[test]
fn concurrent_turns_on_one_chat_are_serialized() {
    let files = Files::new();
    let engine = Arc::new(with_model(&files, ScriptedBackend::new("abc")));
    let chat = engine.create_chat(None, chat_config()).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let engine = Arc::clone(&engine);
            let chat = chat.clone();
            std::thread::spawn(move || ask(&engine, &chat, &format!("q{i}")))
        })
        .collect();
    for h in handles {
        let (tokens, text) = h.join().unwrap();
        assert_eq!(tokens.unwrap(), 3);
        assert_eq!(text, "abc");
    }

    let history = engine.get_chat_history(&chat).unwrap();
    assert_eq!(history.len(), 9);
    for (i, m) in history.iter().enumerate() {
        assert_eq!(m.sequence_index, i as u64);
    }
    // Each user message is directly followed by its assistant reply.
    for pair in history[1..].chunks(2) {
        assert_eq!(pair[0].role, Role::User);
        assert_eq!(pair[1].role, Role::Assistant);
    }
}

/// Store that parks the first history read of one chat until released.
struct PausingStore {
    inner: SnapshotStore,
    chat: &'static str,
    armed: AtomicBool,
    reached: Barrier,
    release: Barrier,
}

impl PausingStore {
    fn new(chat: &'static str) -> Self {
        Self {
            inner: SnapshotStore::in_memory(),
            chat,
            armed: AtomicBool::new(false),
            reached: Barrier::new(2),
            release: Barrier::new(2),
        }
    }
}

impl Store for PausingStore {
    fn begin(&self) -> pocket_store::Result<()> {
        self.inner.begin()
    }
    fn commit(&self) -> pocket_store::Result<()> {
        self.inner.commit()
    }
    fn rollback(&self) -> pocket_store::Result<()> {
        self.inner.rollback()
    }
    fn transaction_depth(&self) -> u32 {
        self.inner.transaction_depth()
    }
    fn insert_model(&self, record: &ModelRecord) -> pocket_store::Result<()> {
        self.inner.insert_model(record)
    }
    fn get_model(&self, name: &str) -> pocket_store::Result<Option<ModelRecord>> {
        self.inner.get_model(name)
    }
    fn update_model_path(&self, name: &str, path: &Path) -> pocket_store::Result<()> {
        self.inner.update_model_path(name, path)
    }
    fn chat_exists(&self, chat_id: &str) -> pocket_store::Result<bool> {
        self.inner.chat_exists(chat_id)
    }
    fn insert_chat(&self, chat_id: &str, config: &ChatConfig) -> pocket_store::Result<()> {
        self.inner.insert_chat(chat_id, config)
    }
    fn get_chat_config(&self, chat_id: &str) -> pocket_store::Result<Option<ChatConfig>> {
        self.inner.get_chat_config(chat_id)
    }
    fn max_sequence_index(&self, chat_id: &str) -> pocket_store::Result<Option<u64>> {
        self.inner.max_sequence_index(chat_id)
    }
    fn append_message(&self, message: &ChatMessage) -> pocket_store::Result<()> {
        self.inner.append_message(message)
    }
    fn messages(&self, chat_id: &str) -> pocket_store::Result<Vec<ChatMessage>> {
        if chat_id == self.chat && self.armed.swap(false, Ordering::SeqCst) {
            self.reached.wait();
            self.release.wait();
        }
        self.inner.messages(chat_id)
    }
    fn close(&self) -> pocket_store::Result<()> {
        self.inner.close()
    }
}

#[test]
fn swap_during_rebuild_never_binds_the_wrong_model() {
    let files = Files::new();
    let store = Arc::new(PausingStore::new("a"));
    let engine = Engine::new(
        ScriptedBackend::new("ok"),
        store.clone(),
        EngineConfig::default(),
    )
    .unwrap();
    let m1 = files.model("a.gguf", b"weights a");
    engine.register_model("m1", &m1, ModelKind::Llm).unwrap();
    engine
        .register_model("m2", &files.model("b.gguf", b"weights b"), ModelKind::Llm)
        .unwrap();
    engine
        .create_chat(Some("a"), ChatConfig::new("sys", "m1"))
        .unwrap();
    engine
        .create_chat(Some("b"), ChatConfig::new("sys", "m2"))
        .unwrap();

    store.armed.store(true, Ordering::SeqCst);
    std::thread::scope(|scope| {
        // Activates m1, then parks while reading a's history.
        let loader = scope.spawn(|| engine.load_chat("a"));
        store.reached.wait();
        engine.load_chat("b").unwrap();
        store.release.wait();
        loader.join().unwrap().unwrap();
    });

    let backend = engine.runtime().backend();
    assert_eq!(engine.runtime().active_path(ModelKind::Llm).unwrap(), Some(m1));
    assert!(engine.is_chat_loaded("a"));
    assert!(!engine.is_chat_loaded("b"));
    // m1, m2, then m1 again for the retried rebuild.
    assert_eq!(backend.models_loaded(), 3);
    // One context for b and one for a; the stale attempt built none.
    assert_eq!(backend.contexts_created(), 2);

    let (result, text) = ask(&engine, "a", "still m1?");
    assert_eq!(result.unwrap(), 2);
    assert_eq!(text, "ok");
}
