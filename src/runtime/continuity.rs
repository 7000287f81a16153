//! Last-session continuity
//!
//! On first activation the engine adopts the most recently updated session
//! so a returning user lands where they left off. Failures are logged and
//! the engine starts empty.

use super::traits::SessionStore;
use crate::db::{ChatMessage, Session, SessionFilter};

/// Most recently updated session with its messages, if it has any.
pub async fn load_most_recent<S: SessionStore + ?Sized>(
    store: &S,
) -> Option<(Session, Vec<ChatMessage>)> {
    let session = match store.list_sessions(&SessionFilter::most_recent()).await {
        Ok(sessions) => sessions.into_iter().next()?,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to list sessions for continuity");
            return None;
        }
    };

    match store.get_messages(&session.id).await {
        Ok(messages) if messages.is_empty() => {
            tracing::debug!(session_id = %session.id, "Most recent session is empty, not resuming");
            None
        }
        Ok(messages) => Some((session, messages)),
        Err(e) => {
            tracing::warn!(
                session_id = %session.id,
                error = %e,
                "Failed to load messages for continuity"
            );
            None
        }
    }
}
