//! Conversation state types

use crate::db::ErrorKind;
use crate::gate::{DataRequest, Gate, PendingAction};
use serde::{Deserialize, Serialize};

/// What started the turn currently in flight
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnKind {
    /// A user message (typed or chosen from buttons)
    Message,
    /// Resumption of a suspended call with the user's answer
    Confirmation { confirmed: bool },
    /// Continuation carrying submitted form values
    DataSubmission,
}

/// Conversation state
///
/// At most one of {turn in flight, pending action, data request} exists at
/// a time because each lives in its own variant.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConvState {
    /// Ready for user input, no pending operations
    #[default]
    Idle,

    /// Streaming call issued, no tokens yet
    Loading { turn: TurnKind },

    /// Tokens arriving; `buffer` holds their concatenation
    Streaming { turn: TurnKind, buffer: String },

    /// The agent proposed a mutation and waits for consent
    AwaitingConfirmation { pending_action: PendingAction },

    /// The agent needs structured input before it can continue
    AwaitingData { request: DataRequest },

    /// Turn failed - UI displays this state directly
    Error {
        message: String,
        error_kind: ErrorKind,
    },
}

impl ConvState {
    /// Name of the variant, as used on the wire
    pub fn name(&self) -> &'static str {
        match self {
            ConvState::Idle => "idle",
            ConvState::Loading { .. } => "loading",
            ConvState::Streaming { .. } => "streaming",
            ConvState::AwaitingConfirmation { .. } => "awaiting_confirmation",
            ConvState::AwaitingData { .. } => "awaiting_data",
            ConvState::Error { .. } => "error",
        }
    }

    /// Check if a streaming call is in flight
    pub fn is_in_flight(&self) -> bool {
        matches!(self, ConvState::Loading { .. } | ConvState::Streaming { .. })
    }

    /// Whether a new user message would be accepted
    pub fn accepts_input(&self) -> bool {
        matches!(self, ConvState::Idle | ConvState::Error { .. })
    }

    /// The interrupt currently holding the conversation
    pub fn gate(&self) -> Gate<'_> {
        match self {
            ConvState::AwaitingConfirmation { pending_action } => {
                Gate::AwaitingConfirmation(pending_action)
            }
            ConvState::AwaitingData { request } => Gate::AwaitingData(request),
            _ => Gate::Idle,
        }
    }

    /// Text streamed so far in the current turn
    pub fn streaming_text(&self) -> Option<&str> {
        match self {
            ConvState::Streaming { buffer, .. } => Some(buffer),
            _ => None,
        }
    }
}
