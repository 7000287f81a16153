//! Effects produced by state transitions

use crate::db::Role;
use crate::gate::ConfirmationPayload;
use crate::protocol::{InteractiveContent, OutgoingMessage};

/// Effects to be executed after state transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Create a session titled after `first_message` unless one is active
    EnsureSession { first_message: String },

    /// Append a message to the conversation and persist it
    AppendMessage {
        role: Role,
        content: String,
        interactive: InteractiveContent,
    },

    /// Open a streaming call (spawns as background task)
    OpenStream {
        messages: Vec<OutgoingMessage>,
        confirmation: Option<ConfirmationPayload>,
    },

    /// Adopt the session the agent reported for this turn
    AttachSession { session_id: String },

    /// Notify connected clients of streamed text
    NotifyToken { text: String },

    /// Notify connected clients that the agent started a tool
    NotifyToolStart { name: String },

    /// The streaming call reached its terminal event
    NotifyTurnComplete,
}

impl Effect {
    pub fn append_user(content: impl Into<String>) -> Self {
        Effect::AppendMessage {
            role: Role::User,
            content: content.into(),
            interactive: Vec::new(),
        }
    }

    pub fn append_assistant(content: impl Into<String>, interactive: InteractiveContent) -> Self {
        Effect::AppendMessage {
            role: Role::Assistant,
            content: content.into(),
            interactive,
        }
    }

    pub fn open_stream(messages: Vec<OutgoingMessage>) -> Self {
        Effect::OpenStream {
            messages,
            confirmation: None,
        }
    }

    pub fn resume_stream(confirmation: ConfirmationPayload) -> Self {
        Effect::OpenStream {
            messages: Vec::new(),
            confirmation: Some(confirmation),
        }
    }
}
