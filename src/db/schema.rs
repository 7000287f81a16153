//! Database schema and types

use crate::protocol::InteractiveContent;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// SQL schema for initialization
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    last_message_preview TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sessions_updated ON sessions(updated_at DESC);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    sequence_id INTEGER NOT NULL,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    tool_calls TEXT,
    interactive TEXT,
    created_at TEXT NOT NULL,

    FOREIGN KEY (session_id) REFERENCES sessions(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, sequence_id);
";

/// One persisted conversation thread
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub title: String,
    /// Truncated content of the latest message
    pub last_message_preview: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    /// In-memory only; never written to the store
    Tool,
}

impl Role {
    /// Whether messages with this role cross the persistence boundary
    pub fn is_persisted(self) -> bool {
        !matches!(self, Role::Tool)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
            Role::Tool => "tool",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "system" => Ok(Role::System),
            "tool" => Ok(Role::Tool),
            other => Err(format!("Unknown role: {other}")),
        }
    }
}

/// One turn in a conversation. Immutable once created, except that a
/// buttons element records its answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    /// Opaque tool-call record, passed through untouched
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub interactive: InteractiveContent,
    pub created_at: DateTime<Utc>,
}

impl From<&ChatMessage> for NewMessage {
    fn from(message: &ChatMessage) -> Self {
        Self {
            role: message.role,
            content: message.content.clone(),
            tool_calls: message.tool_calls.clone(),
            interactive: message.interactive.clone(),
        }
    }
}

/// Message to append to a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub tool_calls: Option<Value>,
    #[serde(default)]
    pub interactive: InteractiveContent,
}

impl NewMessage {
    #[allow(dead_code)] // Used in tests
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_calls: None,
            interactive: Vec::new(),
        }
    }

    /// Stamp the message with its id and creation time
    pub fn into_message(self, id: &str) -> ChatMessage {
        ChatMessage {
            id: id.to_string(),
            role: self.role,
            content: self.content,
            tool_calls: self.tool_calls,
            interactive: self.interactive,
            created_at: Utc::now(),
        }
    }
}

/// Criteria for listing sessions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionFilter {
    /// Case-insensitive substring of title or preview
    #[serde(default)]
    pub search: Option<String>,
    /// Inclusive lower bound on the last update day
    #[serde(default)]
    pub date_from: Option<NaiveDate>,
    /// Inclusive upper bound on the last update day
    #[serde(default)]
    pub date_to: Option<NaiveDate>,
    #[serde(default)]
    pub limit: Option<u32>,
}

impl SessionFilter {
    /// Only the most recently updated session
    pub fn most_recent() -> Self {
        Self {
            limit: Some(1),
            ..Self::default()
        }
    }

    /// In-process form of the filter, for stores without a query engine
    #[cfg(test)]
    pub fn matches(&self, session: &Session) -> bool {
        if let Some(search) = self.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            let needle = search.to_lowercase();
            let in_title = session.title.to_lowercase().contains(&needle);
            let in_preview = session
                .last_message_preview
                .as_deref()
                .is_some_and(|p| p.to_lowercase().contains(&needle));
            if !in_title && !in_preview {
                return false;
            }
        }
        let day = session.updated_at.date_naive();
        if self.date_from.is_some_and(|from| day < from) {
            return false;
        }
        if self.date_to.is_some_and(|to| day > to) {
            return false;
        }
        true
    }
}

/// Error classification for UI display
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The streaming call could not be made or broke off
    Network,
    /// The agent reported an error event
    Agent,
    /// The session store rejected an operation the turn depends on
    Persistence,
}
