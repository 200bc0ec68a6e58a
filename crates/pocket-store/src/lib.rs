//! # pocket-store
//!
//! Transactional persistence for pocket.
//!
//! Supports:
//! - **Models**: name → path, checksum and kind
//! - **Chats**: per-chat configuration, immutable once written
//! - **Messages**: append-only history ordered by a per-chat `sequence_index`
//! - **Nested transactions**: `begin`/`commit` nest by reference counting;
//!   only the outermost pair touches the backing store, and `rollback` at any
//!   depth abandons the whole unit of work
//!
//! [`Store`] is the capability the session layer is written against.
//! [`SnapshotStore`] is the bundled implementation: in-memory, or durably
//! backed by a JSON snapshot file rewritten atomically on every commit.

pub mod records;
pub mod snapshot;

use std::path::Path;

pub use records::{ChatConfig, ChatMessage, ModelRecord, NewMessage, Role};
pub use snapshot::SnapshotStore;

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Already exists: {0}")]
    AlreadyExists(String),
    #[error("Constraint violated: {0}")]
    Constraint(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Transaction error: {0}")]
    Transaction(String),
    #[error("Store is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Transactional storage for models, chats and messages.
///
/// Methods take `&self`; implementations synchronize internally so one store
/// can be shared by every session.
pub trait Store: Send + Sync {
    /// Enter a transaction, opening a physical one when depth goes 0 → 1.
    fn begin(&self) -> Result<()>;

    /// Leave a transaction, physically committing when depth goes 1 → 0.
    fn commit(&self) -> Result<()>;

    /// Abort the physical transaction and reset depth to 0. A no-op when no
    /// transaction is open.
    fn rollback(&self) -> Result<()>;

    fn transaction_depth(&self) -> u32;

    /// Fails with `AlreadyExists` when the name is taken.
    fn insert_model(&self, record: &ModelRecord) -> Result<()>;

    fn get_model(&self, name: &str) -> Result<Option<ModelRecord>>;

    /// Fails with `NotFound` when the name is unknown.
    fn update_model_path(&self, name: &str, path: &Path) -> Result<()>;

    fn chat_exists(&self, chat_id: &str) -> Result<bool>;

    /// Fails with `AlreadyExists` when the id is taken.
    fn insert_chat(&self, chat_id: &str, config: &ChatConfig) -> Result<()>;

    fn get_chat_config(&self, chat_id: &str) -> Result<Option<ChatConfig>>;

    /// Highest `sequence_index` stored for the chat.
    fn max_sequence_index(&self, chat_id: &str) -> Result<Option<u64>>;

    /// Insert one fully-formed row. Fails with `Constraint` when the chat does
    /// not exist, the `(chat_id, sequence_index)` pair is taken, or the
    /// metadata is not a JSON object.
    fn append_message(&self, message: &ChatMessage) -> Result<()>;

    /// Messages of a chat in `sequence_index` order.
    fn messages(&self, chat_id: &str) -> Result<Vec<ChatMessage>>;

    /// Release the backing resources. Later calls fail with `Closed`.
    fn close(&self) -> Result<()>;

    /// Append `messages` to a chat, numbering them after the current maximum.
    ///
    /// All or nothing: if any row fails, the whole batch (and any enclosing
    /// transaction) is rolled back.
    fn insert_messages(&self, chat_id: &str, messages: Vec<NewMessage>) -> Result<Vec<u64>> {
        in_transaction(self, |store| {
            let mut assigned = Vec::with_capacity(messages.len());
            for message in messages {
                let next = store.max_sequence_index(chat_id)?.map_or(0, |max| max + 1);
                store.append_message(&message.into_row(chat_id, next))?;
                assigned.push(next);
            }
            Ok(assigned)
        })
    }

    /// Create a chat and seed it with its system prompt as message 0.
    fn create_chat(&self, chat_id: &str, config: &ChatConfig) -> Result<()> {
        config.validate()?;
        in_transaction(self, |store| {
            if store.chat_exists(chat_id)? {
                return Err(StoreError::AlreadyExists(format!("chat '{chat_id}'")));
            }
            store.insert_chat(chat_id, config)?;
            store.insert_messages(chat_id, vec![NewMessage::system(config.system_prompt.clone())])?;
            Ok(())
        })
    }

    /// Ordered history of a chat. Every created chat holds at least its
    /// system message, so an empty history is reported as `NotFound`.
    fn get_history(&self, chat_id: &str) -> Result<Vec<ChatMessage>> {
        let messages = self.messages(chat_id)?;
        if messages.is_empty() {
            return Err(StoreError::NotFound(format!("no messages for chat '{chat_id}'")));
        }
        Ok(messages)
    }
}

/// Run `f` between `begin` and `commit`, rolling back if it fails.
///
/// Nests: inside an open transaction this only adjusts the depth counter.
pub fn in_transaction<S, T, F>(store: &S, f: F) -> Result<T>
where
    S: Store + ?Sized,
    F: FnOnce(&S) -> Result<T>,
{
    store.begin()?;
    match f(store) {
        Ok(value) => match store.commit() {
            Ok(()) => Ok(value),
            Err(e) => {
                if let Err(rollback_err) = store.rollback() {
                    tracing::warn!(error = %rollback_err, "rollback after failed commit also failed");
                }
                Err(e)
            }
        },
        Err(e) => {
            if let Err(rollback_err) = store.rollback() {
                tracing::warn!(error = %rollback_err, "rollback after failed transaction also failed");
            }
            Err(e)
        }
    }
}
