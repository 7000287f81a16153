//! HTTP transport for streaming turns
//!
//! Posts a turn to the agent endpoint and reads the reply as server-sent
//! events, one JSON [`StreamEvent`] per `data:` line.

use crate::protocol::{StreamEvent, StreamRequest};
use crate::runtime::{EventStream, StreamTransport};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use reqwest_eventsource::{Error as SseError, Event as SseEvent, EventSource};
use std::time::Duration;
use thiserror::Error;

/// Failure to open or read a streaming call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("Agent endpoint is not configured")]
    NotConfigured,
    #[error("Connection failed: {0}")]
    Connect(String),
    #[error("Agent returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("Unexpected response: {0}")]
    Protocol(String),
    #[error("Stream interrupted: {0}")]
    Interrupted(String),
}

/// Time allowed to establish the connection to the agent
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Streams turns from the agent over HTTP
pub struct HttpTransport {
    client: Client,
    url: Option<String>,
    api_key: Option<String>,
}

impl HttpTransport {
    /// `idle_timeout` bounds the silence between two reads, so a long turn
    /// that keeps streaming is never cut off.
    pub fn new(
        url: Option<String>,
        api_key: Option<String>,
        idle_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(idle_timeout)
            .build()
            .map_err(|e| TransportError::Connect(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            url,
            api_key,
        })
    }

    pub fn is_configured(&self) -> bool {
        self.url.is_some()
    }
}

#[async_trait]
impl StreamTransport for HttpTransport {
    async fn open(&self, request: &StreamRequest) -> Result<EventStream, TransportError> {
        let url = self.url.as_deref().ok_or(TransportError::NotConfigured)?;

        let mut builder = self
            .client
            .post(url)
            .header("Accept", "text/event-stream")
            .json(request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let source = EventSource::new(builder).map_err(|e| TransportError::Connect(e.to_string()))?;

        tracing::debug!(
            url = %url,
            resumption = request.is_resumption(),
            messages = request.messages.len(),
            "Opening agent stream"
        );

        // EventSource reconnects on its own; a turn is one-shot, so the
        // source is closed as soon as the call is over.
        let events = futures::stream::unfold(Some(source), |source| async move {
            let mut source = source?;
            loop {
                match source.next().await {
                    Some(Ok(SseEvent::Open)) => {}
                    Some(Ok(SseEvent::Message(message))) => {
                        let Some(event) = decode_event(&message.data) else {
                            continue;
                        };
                        if event.is_terminal() {
                            source.close();
                            return Some((Ok(event), None));
                        }
                        return Some((Ok(event), Some(source)));
                    }
                    Some(Err(SseError::StreamEnded)) | None => {
                        source.close();
                        return None;
                    }
                    Some(Err(e)) => {
                        source.close();
                        return Some((Err(classify_error(e).await), None));
                    }
                }
            }
        });

        Ok(Box::pin(events))
    }
}

/// Parse one `data:` payload. Keep-alive markers and events of unknown
/// type are skipped.
fn decode_event(data: &str) -> Option<StreamEvent> {
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    match serde_json::from_str(data) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(error = %e, data = %data, "Skipping unrecognised stream event");
            None
        }
    }
}

async fn classify_error(error: SseError) -> TransportError {
    match error {
        SseError::InvalidStatusCode(status, response) => TransportError::Status {
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        },
        SseError::InvalidContentType(content_type, _) => TransportError::Protocol(format!(
            "expected text/event-stream, got {}",
            content_type.to_str().unwrap_or("<binary>")
        )),
        SseError::Transport(e) if e.is_timeout() => {
            TransportError::Interrupted(format!("Request timeout: {e}"))
        }
        SseError::Transport(e) if e.is_connect() => TransportError::Connect(e.to_string()),
        other => TransportError::Interrupted(other.to_string()),
    }
}
