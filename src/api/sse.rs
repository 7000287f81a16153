//! Server-Sent Events support

use crate::runtime::{EngineSnapshot, EngineUpdate};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// Init event with the full snapshot, then every engine update
pub fn sse_stream(
    snapshot: EngineSnapshot,
    broadcast_rx: tokio::sync::broadcast::Receiver<EngineUpdate>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let init = futures::stream::once(async move {
        Ok(to_axum_event("init", &json!({ "type": "init", "snapshot": snapshot })))
    });

    let updates = BroadcastStream::new(broadcast_rx).filter_map(|result| match result {
        Ok(update) => {
            let (event_type, data) = update_payload(update);
            Some(Ok(to_axum_event(event_type, &data)))
        }
        Err(e) => {
            // Lagged receivers skip ahead; the client resyncs on the next state_change
            tracing::debug!(error = %e, "SSE subscriber lagged");
            None
        }
    });

    Sse::new(init.chain(updates)).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn to_axum_event(event_type: &str, data: &Value) -> Event {
    Event::default().event(event_type).data(data.to_string())
}

fn update_payload(update: EngineUpdate) -> (&'static str, Value) {
    match update {
        EngineUpdate::StateChange { state } => (
            "state_change",
            json!({ "type": "state_change", "state": state }),
        ),
        EngineUpdate::Message { message } => {
            ("message", json!({ "type": "message", "message": message }))
        }
        EngineUpdate::MessageUpdated { message } => (
            "message_updated",
            json!({ "type": "message_updated", "message": message }),
        ),
        EngineUpdate::Token { text } => ("token", json!({ "type": "token", "text": text })),
        EngineUpdate::ToolStarted { name } => (
            "tool_started",
            json!({ "type": "tool_started", "name": name }),
        ),
        EngineUpdate::SessionChanged { session, messages } => (
            "session_changed",
            json!({ "type": "session_changed", "session": session, "messages": messages }),
        ),
        EngineUpdate::TurnComplete => ("turn_complete", json!({ "type": "turn_complete" })),
        EngineUpdate::Error { message } => {
            ("error", json!({ "type": "error", "message": message }))
        }
    }
}
