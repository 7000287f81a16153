//! Streaming turn vocabulary: what a turn sends and what it receives

use super::elements::{deserialize_elements, InteractiveContent};
use crate::db::Role;
use crate::gate::{ConfirmationPayload, DataRequest, PendingAction};
use serde::{Deserialize, Serialize};

/// One event of a streaming turn, in arrival order.
///
/// `NeedsConfirmation`, `NeedsData`, `Done` and `Error` are terminal: no
/// further events of the same call are processed after them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    /// Incremental text
    Token { text: String },
    /// The agent started a tool; informational only
    ToolStart { name: String },
    NeedsConfirmation {
        #[serde(default)]
        message: String,
        #[serde(rename = "pendingAction")]
        pending_action: PendingAction,
    },
    NeedsData {
        #[serde(default)]
        message: String,
        #[serde(rename = "dataRequest")]
        data_request: DataRequest,
    },
    Done {
        /// Set when the call created the session server-side
        #[serde(rename = "sessionId", default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(
            default,
            deserialize_with = "deserialize_elements",
            skip_serializing_if = "Vec::is_empty"
        )]
        interactive: InteractiveContent,
    },
    Error { message: String },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StreamEvent::Token { .. } | StreamEvent::ToolStart { .. })
    }

    /// Event name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Token { .. } => "token",
            StreamEvent::ToolStart { .. } => "tool_start",
            StreamEvent::NeedsConfirmation { .. } => "needs_confirmation",
            StreamEvent::NeedsData { .. } => "needs_data",
            StreamEvent::Done { .. } => "done",
            StreamEvent::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
impl StreamEvent {
    pub fn token(text: impl Into<String>) -> Self {
        StreamEvent::Token { text: text.into() }
    }

    pub fn done() -> Self {
        StreamEvent::Done {
            session_id: None,
            interactive: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        StreamEvent::Error {
            message: message.into(),
        }
    }
}

/// A message sent as part of a streaming call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub role: Role,
    pub content: String,
}

impl OutgoingMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Body of one streaming call.
///
/// A confirmation resumption carries the confirmation payload in place of
/// a message list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<OutgoingMessage>,
    pub session_id: Option<String>,
    #[serde(flatten)]
    pub confirmation: Option<ConfirmationPayload>,
}

impl StreamRequest {
    pub fn is_resumption(&self) -> bool {
        self.confirmation.is_some()
    }
}
