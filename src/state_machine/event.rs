//! Events that can occur in a conversation

use crate::gate::FieldValues;
use crate::protocol::StreamEvent;

/// Events that trigger state transitions
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    // User events
    UserMessage { text: String },
    Confirm,
    Reject,
    SubmitData { values: FieldValues },
    CancelData,
    ClearError,

    // Transport events
    /// One event of the current streaming call
    Stream(StreamEvent),
    /// The call could not be opened, broke off, or ended without a
    /// terminal event
    TransportFailed { message: String },
}

impl Event {
    pub fn user_message(text: impl Into<String>) -> Self {
        Event::UserMessage { text: text.into() }
    }

    /// Whether the event comes from the transport rather than the user
    pub fn is_transport(&self) -> bool {
        matches!(self, Event::Stream(_) | Event::TransportFailed { .. })
    }
}
