//! In-memory tables with optional JSON snapshot durability.
//!
//! A physical transaction works on a copy of the committed tables; commit
//! swaps the copy in, rollback drops it. With a path configured, the tables
//! are written to disk (temp file, fsync, rename) before the swap, so the
//! file always holds the last committed state.
//!
//! An open transaction belongs to the thread that began it. Other threads
//! keep reading the committed tables and block on writes or `begin` until
//! the owner commits or rolls back.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::thread::{self, ThreadId};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{ChatConfig, ChatMessage, ModelRecord, Result, Store, StoreError};

const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Tables {
    models: BTreeMap<String, ModelRecord>,
    chats: BTreeMap<String, ChatConfig>,
    /// Per chat, sorted by `sequence_index`.
    messages: BTreeMap<String, Vec<ChatMessage>>,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    schema_version: u32,
    #[serde(flatten)]
    tables: Tables,
}

#[derive(Debug, Default)]
struct State {
    committed: Tables,
    /// Present while a physical transaction is open.
    working: Option<Tables>,
    depth: u32,
    owner: Option<ThreadId>,
    closed: bool,
}

impl State {
    fn owned_by_current(&self) -> bool {
        self.owner == Some(thread::current().id())
    }

    fn view(&self) -> &Tables {
        match &self.working {
            Some(working) if self.owned_by_current() => working,
            _ => &self.committed,
        }
    }

    fn end_transaction(&mut self) {
        self.working = None;
        self.depth = 0;
        self.owner = None;
    }
}

/// Transactional store over in-memory tables.
pub struct SnapshotStore {
    path: Option<PathBuf>,
    state: Mutex<State>,
    /// Signalled whenever a transaction ends or the store closes.
    released: Condvar,
    physical_commits: AtomicU64,
}

impl SnapshotStore {
    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(State::default()),
            released: Condvar::new(),
            physical_commits: AtomicU64::new(0),
        }
    }

    /// Open (or create) a store backed by the snapshot file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let committed = Self::load(&path)?;
        debug!(path = %path.display(), chats = committed.chats.len(), "opened snapshot store");
        Ok(Self {
            path: Some(path),
            state: Mutex::new(State {
                committed,
                ..State::default()
            }),
            released: Condvar::new(),
            physical_commits: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of outermost commits (including autocommitted writes).
    pub fn physical_commits(&self) -> u64 {
        self.physical_commits.load(Ordering::Relaxed)
    }

    fn load(path: &Path) -> Result<Tables> {
        if !path.exists() {
            return Ok(Tables::default());
        }
        let content = fs::read(path)?;
        if content.iter().all(u8::is_ascii_whitespace) {
            return Ok(Tables::default());
        }
        let snapshot: Snapshot = serde_json::from_slice(&content)?;
        if snapshot.schema_version != SCHEMA_VERSION {
            return Err(StoreError::Transaction(format!(
                "unsupported snapshot schema version {} (expected {SCHEMA_VERSION})",
                snapshot.schema_version
            )));
        }
        Ok(snapshot.tables)
    }

    fn persist(&self, tables: &Tables) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        let snapshot = Snapshot {
            schema_version: SCHEMA_VERSION,
            tables: tables.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;

        let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = path.with_file_name(tmp_name);

        let mut tmp_file = File::create(&tmp_path)?;
        tmp_file.write_all(&bytes)?;
        tmp_file.sync_all()?;
        drop(tmp_file);

        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        let state = self.state.lock().map_err(|_| poisoned())?;
        if state.closed {
            return Err(StoreError::Closed);
        }
        Ok(state)
    }

    /// Lock, waiting out any transaction owned by another thread.
    fn lock_for_write(&self) -> Result<MutexGuard<'_, State>> {
        let mut state = self.lock()?;
        while state.depth > 0 && !state.owned_by_current() {
            state = self.released.wait(state).map_err(|_| poisoned())?;
            if state.closed {
                return Err(StoreError::Closed);
            }
        }
        Ok(state)
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> T) -> Result<T> {
        let state = self.lock()?;
        Ok(f(state.view()))
    }

    /// Apply a mutation to the open transaction, or autocommit it.
    ///
    /// `f` must check its preconditions before mutating.
    fn write<T>(&self, f: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
        let mut state = self.lock_for_write()?;
        if let Some(working) = state.working.as_mut() {
            return f(working);
        }
        let mut next = state.committed.clone();
        let value = f(&mut next)?;
        self.persist(&next)?;
        state.committed = next;
        self.physical_commits.fetch_add(1, Ordering::Relaxed);
        Ok(value)
    }
}

impl Store for SnapshotStore {
    fn begin(&self) -> Result<()> {
        let mut state = self.lock_for_write()?;
        if state.depth == 0 {
            state.working = Some(state.committed.clone());
            state.owner = Some(thread::current().id());
        }
        state.depth += 1;
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let mut state = self.lock()?;
        if state.depth == 0 || !state.owned_by_current() {
            return Err(StoreError::Transaction(
                "commit without an open transaction".to_string(),
            ));
        }
        state.depth -= 1;
        if state.depth > 0 {
            return Ok(());
        }
        let tables = state.working.take();
        state.end_transaction();
        self.released.notify_all();

        let tables = tables.ok_or_else(|| {
            StoreError::Transaction("open transaction has no working set".to_string())
        })?;
        if let Err(e) = self.persist(&tables) {
            warn!(error = %e, "snapshot write failed, transaction discarded");
            return Err(e);
        }
        state.committed = tables;
        self.physical_commits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn rollback(&self) -> Result<()> {
        let mut state = self.lock()?;
        if state.depth > 0 && state.owned_by_current() {
            debug!(depth = state.depth, "rolling back transaction");
            state.end_transaction();
            self.released.notify_all();
        }
        Ok(())
    }

    fn transaction_depth(&self) -> u32 {
        self.state.lock().map(|s| s.depth).unwrap_or(0)
    }

    fn insert_model(&self, record: &ModelRecord) -> Result<()> {
        self.write(|t| {
            if t.models.contains_key(&record.name) {
                return Err(StoreError::AlreadyExists(format!("model '{}'", record.name)));
            }
            t.models.insert(record.name.clone(), record.clone());
            Ok(())
        })
    }

    fn get_model(&self, name: &str) -> Result<Option<ModelRecord>> {
        self.read(|t| t.models.get(name).cloned())
    }

    fn update_model_path(&self, name: &str, path: &Path) -> Result<()> {
        self.write(|t| match t.models.get_mut(name) {
            Some(record) => {
                record.path = path.to_path_buf();
                Ok(())
            }
            None => Err(StoreError::NotFound(format!("model '{name}'"))),
        })
    }

    fn chat_exists(&self, chat_id: &str) -> Result<bool> {
        self.read(|t| t.chats.contains_key(chat_id))
    }

    fn insert_chat(&self, chat_id: &str, config: &ChatConfig) -> Result<()> {
        self.write(|t| {
            if t.chats.contains_key(chat_id) {
                return Err(StoreError::AlreadyExists(format!("chat '{chat_id}'")));
            }
            t.chats.insert(chat_id.to_string(), config.clone());
            Ok(())
        })
    }

    fn get_chat_config(&self, chat_id: &str) -> Result<Option<ChatConfig>> {
        self.read(|t| t.chats.get(chat_id).cloned())
    }

    fn max_sequence_index(&self, chat_id: &str) -> Result<Option<u64>> {
        self.read(|t| {
            t.messages
                .get(chat_id)
                .and_then(|rows| rows.last())
                .map(|row| row.sequence_index)
        })
    }

    fn append_message(&self, message: &ChatMessage) -> Result<()> {
        self.write(|t| {
            if !t.chats.contains_key(&message.chat_id) {
                return Err(StoreError::Constraint(format!(
                    "chat '{}' does not exist",
                    message.chat_id
                )));
            }
            if !message.metadata.is_object() {
                return Err(StoreError::Constraint(
                    "message metadata must be a JSON object".to_string(),
                ));
            }
            let rows = t.messages.entry(message.chat_id.clone()).or_default();
            match rows.binary_search_by_key(&message.sequence_index, |row| row.sequence_index) {
                Ok(_) => Err(StoreError::Constraint(format!(
                    "sequence_index {} already used in chat '{}'",
                    message.sequence_index, message.chat_id
                ))),
                Err(pos) => {
                    rows.insert(pos, message.clone());
                    Ok(())
                }
            }
        })
    }

    fn messages(&self, chat_id: &str) -> Result<Vec<ChatMessage>> {
        self.read(|t| t.messages.get(chat_id).cloned().unwrap_or_default())
    }

    fn close(&self) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        if state.depth > 0 {
            warn!(depth = state.depth, "closing store with an open transaction; rolling back");
        }
        state.end_transaction();
        state.closed = true;
        self.released.notify_all();
        Ok(())
    }
}

fn poisoned() -> StoreError {
    StoreError::Transaction("store lock poisoned".to_string())
}
