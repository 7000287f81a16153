//! Pure state transition function

use super::state::TurnKind;
use super::{ConvState, Effect, Event};
use crate::db::ErrorKind;
use crate::gate::{format_submission, FieldErrors, FieldValues, DATA_CANCELLED_MESSAGE};
use crate::protocol::{OutgoingMessage, StreamEvent};
use thiserror::Error;

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: ConvState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(state: ConvState) -> Self {
        Self {
            new_state: state,
            effects: vec![],
        }
    }

    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    pub fn with_effects(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        self.effects.extend(effects);
        self
    }
}

/// Errors that can occur during transition
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransitionError {
    #[error("Agent is busy, wait for the current reply to finish")]
    AgentBusy,
    #[error("Answer the pending request before sending a new message")]
    GateOpen,
    #[error("No action is awaiting confirmation")]
    NoPendingAction,
    #[error("No data request is open")]
    NoDataRequest,
    #[error("Invalid field values")]
    Validation(FieldErrors),
    #[error("Message is empty")]
    EmptyMessage,
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),
}

/// Pure transition function
///
/// Given the same inputs it always produces the same outputs, with no I/O.
pub fn transition(state: &ConvState, event: Event) -> Result<TransitionResult, TransitionError> {
    match event {
        Event::UserMessage { text } => on_user_message(state, text),
        Event::Confirm => on_confirmation(state, true),
        Event::Reject => on_confirmation(state, false),
        Event::SubmitData { values } => on_submit(state, &values),
        Event::CancelData => on_cancel(state),
        Event::ClearError => match state {
            ConvState::Error { .. } => Ok(TransitionResult::new(ConvState::Idle)),
            // Nothing to dismiss
            _ => Ok(TransitionResult::new(state.clone())),
        },
        Event::Stream(event) => on_stream(state, event),
        Event::TransportFailed { message } => on_transport_failed(state, message),
    }
}

/// Busy while a call is in flight, otherwise `fallback`
fn refuse(state: &ConvState, fallback: TransitionError) -> TransitionError {
    if state.is_in_flight() {
        TransitionError::AgentBusy
    } else {
        fallback
    }
}

fn on_user_message(state: &ConvState, text: String) -> Result<TransitionResult, TransitionError> {
    match state {
        ConvState::Idle | ConvState::Error { .. } => {
            if text.trim().is_empty() {
                return Err(TransitionError::EmptyMessage);
            }
            Ok(TransitionResult::new(ConvState::Loading {
                turn: TurnKind::Message,
            })
            .with_effect(Effect::append_user(text.clone()))
            .with_effect(Effect::EnsureSession {
                first_message: text.clone(),
            })
            .with_effect(Effect::open_stream(vec![OutgoingMessage::user(text)])))
        }
        _ => Err(refuse(state, TransitionError::GateOpen)),
    }
}

fn on_confirmation(
    state: &ConvState,
    confirmed: bool,
) -> Result<TransitionResult, TransitionError> {
    match state {
        ConvState::AwaitingConfirmation { pending_action } => {
            Ok(resume(pending_action.resolve(confirmed)))
        }
        _ => Err(refuse(state, TransitionError::NoPendingAction)),
    }
}

fn on_submit(state: &ConvState, values: &FieldValues) -> Result<TransitionResult, TransitionError> {
    let ConvState::AwaitingData { request } = state else {
        return Err(refuse(state, TransitionError::NoDataRequest));
    };
    request.validate(values).map_err(TransitionError::Validation)?;
    let body = format_submission(values);
    Ok(TransitionResult::new(ConvState::Loading {
        turn: TurnKind::DataSubmission,
    })
    .with_effect(Effect::append_user(body.clone()))
    .with_effect(Effect::open_stream(vec![OutgoingMessage::user(body)])))
}

/// Closes locally, no round trip
fn on_cancel(state: &ConvState) -> Result<TransitionResult, TransitionError> {
    match state {
        ConvState::AwaitingData { .. } => Ok(TransitionResult::new(ConvState::Idle)
            .with_effect(Effect::append_assistant(DATA_CANCELLED_MESSAGE, Vec::new()))),
        _ => Err(refuse(state, TransitionError::NoDataRequest)),
    }
}

fn on_stream(state: &ConvState, event: StreamEvent) -> Result<TransitionResult, TransitionError> {
    let turn = match state {
        ConvState::Loading { turn } | ConvState::Streaming { turn, .. } => *turn,
        _ => return Err(no_call_in_flight(state, &Event::Stream(event))),
    };
    let buffer = buffer_of(state);

    let result = match event {
        StreamEvent::Token { text } => TransitionResult::new(ConvState::Streaming {
            turn,
            buffer: format!("{buffer}{text}"),
        })
        .with_effect(Effect::NotifyToken { text }),

        StreamEvent::ToolStart { name } => {
            TransitionResult::new(state.clone()).with_effect(Effect::NotifyToolStart { name })
        }

        StreamEvent::NeedsConfirmation {
            message,
            pending_action,
        } => TransitionResult::new(ConvState::AwaitingConfirmation { pending_action })
            .with_effects(commit(join_text(buffer, &message), Vec::new()))
            .with_effect(Effect::NotifyTurnComplete),

        // A nested request replaces the one just answered
        StreamEvent::NeedsData {
            message,
            data_request,
        } => TransitionResult::new(ConvState::AwaitingData {
            request: data_request,
        })
        .with_effects(commit(join_text(buffer, &message), Vec::new()))
        .with_effect(Effect::NotifyTurnComplete),

        StreamEvent::Done {
            session_id,
            interactive,
        } => {
            let attach = session_id.map(|session_id| Effect::AttachSession { session_id });
            TransitionResult::new(ConvState::Idle)
                .with_effects(attach)
                .with_effects(commit(buffer.to_string(), interactive))
                .with_effect(Effect::NotifyTurnComplete)
        }

        // Partial text is discarded, never committed
        StreamEvent::Error { message } => TransitionResult::new(ConvState::Error {
            message,
            error_kind: ErrorKind::Agent,
        })
        .with_effect(Effect::NotifyTurnComplete),
    };
    Ok(result)
}

fn on_transport_failed(
    state: &ConvState,
    message: String,
) -> Result<TransitionResult, TransitionError> {
    if !state.is_in_flight() {
        return Err(no_call_in_flight(state, &Event::TransportFailed { message }));
    }
    Ok(TransitionResult::new(ConvState::Error {
        message,
        error_kind: ErrorKind::Network,
    })
    .with_effect(Effect::NotifyTurnComplete))
}

fn no_call_in_flight(state: &ConvState, event: &Event) -> TransitionError {
    TransitionError::InvalidTransition(format!(
        "{} has no call in flight for {event:?}",
        state.name()
    ))
}

fn resume(payload: crate::gate::ConfirmationPayload) -> TransitionResult {
    TransitionResult::new(ConvState::Loading {
        turn: TurnKind::Confirmation {
            confirmed: payload.confirmed,
        },
    })
    .with_effect(Effect::resume_stream(payload))
}

fn buffer_of(state: &ConvState) -> &str {
    state.streaming_text().unwrap_or_default()
}

/// Streamed text followed by the event's own message
fn join_text(buffer: &str, message: &str) -> String {
    match (buffer.is_empty(), message.trim().is_empty()) {
        (true, true) => String::new(),
        (true, false) => message.to_string(),
        (false, true) => buffer.to_string(),
        (false, false) => format!("{buffer}\n\n{message}"),
    }
}

/// One assistant message, or none when there is nothing to show
fn commit(
    text: String,
    interactive: crate::protocol::InteractiveContent,
) -> Option<Effect> {
    if text.is_empty() && interactive.is_empty() {
        None
    } else {
        Some(Effect::append_assistant(text, interactive))
    }
}
