//! API request and response types

use crate::db::{ChatMessage, Session};
use crate::gate::{FieldErrors, FieldValues};
use serde::{Deserialize, Serialize};

/// Request to send a chat message
#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub text: String,
}

/// Values for the open data request
#[derive(Debug, Deserialize)]
pub struct SubmitDataRequest {
    #[serde(default)]
    pub values: FieldValues,
}

/// Answer to a buttons element
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChooseOptionRequest {
    pub element_index: usize,
    pub value: String,
}

/// Request to create a session
#[derive(Debug, Default, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub title: Option<String>,
}

/// Request to rename a session
#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub title: String,
}

/// Response with a list of sessions
#[derive(Debug, Serialize)]
pub struct SessionListResponse {
    pub sessions: Vec<Session>,
}

/// Response with a single session
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session: Session,
}

/// Response with a session and its messages
#[derive(Debug, Serialize)]
pub struct SessionWithMessagesResponse {
    pub session: Session,
    pub messages: Vec<ChatMessage>,
}

/// Response with a single message
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: ChatMessage,
}

/// Response for an accepted user action
#[derive(Debug, Serialize)]
pub struct AcceptedResponse {
    pub accepted: bool,
}

impl AcceptedResponse {
    pub fn ok() -> Self {
        Self { accepted: true }
    }
}

/// Generic success response
#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub success: bool,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    /// Per-field messages when a submission failed validation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<FieldErrors>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            fields: None,
        }
    }

    pub fn with_fields(error: impl Into<String>, fields: FieldErrors) -> Self {
        Self {
            error: error.into(),
            fields: Some(fields),
        }
    }
}
