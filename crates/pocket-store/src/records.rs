//! Row types for the three logical tables.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::Utc;
use pocket_engine::ModelKind;
use serde::{Deserialize, Serialize};

use crate::{Result, StoreError};

/// A registered model: `models(name PK, path, checksum, kind)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub name: String,
    pub path: PathBuf,
    pub checksum: String,
    pub kind: ModelKind,
}

impl ModelRecord {
    pub fn new(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        checksum: impl Into<String>,
        kind: ModelKind,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            checksum: checksum.into(),
            kind,
        }
    }
}

/// Per-chat settings, fixed at creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatConfig {
    /// Whether generated exchanges are written to the message table.
    pub persist: bool,
    pub system_prompt: String,
    /// Registered name of the LLM that serves this chat.
    pub model_ref: String,
}

impl ChatConfig {
    pub fn new(system_prompt: impl Into<String>, model_ref: impl Into<String>) -> Self {
        Self {
            persist: true,
            system_prompt: system_prompt.into(),
            model_ref: model_ref.into(),
        }
    }

    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.system_prompt.trim().is_empty() {
            return Err(StoreError::Constraint(
                "system_prompt must not be empty".to_string(),
            ));
        }
        if self.model_ref.trim().is_empty() {
            return Err(StoreError::Constraint("model_ref must not be empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(StoreError::Constraint(format!("unknown role '{other}'"))),
        }
    }
}

/// A message not yet assigned a position in its chat.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    /// Must be a JSON object.
    pub metadata: serde_json::Value,
}

impl NewMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            metadata: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Stamp the message with its chat, position and creation time.
    pub fn into_row(self, chat_id: &str, sequence_index: u64) -> ChatMessage {
        ChatMessage {
            chat_id: chat_id.to_string(),
            role: self.role,
            content: self.content,
            metadata: self.metadata,
            sequence_index,
            created_at: Utc::now().timestamp(),
        }
    }
}

/// A stored message: `chat_messages(chat_id, role, content, sequence_index,
/// metadata, created_at)`, unique on `(chat_id, sequence_index)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub chat_id: String,
    pub role: Role,
    pub content: String,
    pub metadata: serde_json::Value,
    pub sequence_index: u64,
    /// Unix seconds.
    pub created_at: i64,
}
