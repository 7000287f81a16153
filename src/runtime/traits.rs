//! Trait abstractions for runtime I/O
//!
//! These traits enable testing the engine with mock implementations.

use crate::db::{ChatMessage, Database, NewMessage, Session, SessionFilter, StoreResult};
use crate::protocol::{InteractiveContent, StreamEvent, StreamRequest};
use crate::title::DEFAULT_TITLE;
use crate::transport::TransportError;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;

/// Events of one streaming call, in arrival order
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, TransportError>> + Send>>;

/// Durable storage for sessions and their messages
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Create an empty session; `None` uses the default title
    async fn create_session(&self, title: Option<&str>) -> StoreResult<Session>;

    /// Sessions matching the filter, most recently updated first
    async fn list_sessions(&self, filter: &SessionFilter) -> StoreResult<Vec<Session>>;

    async fn get_session(&self, id: &str) -> StoreResult<Session>;

    /// Messages of a session in order
    async fn get_messages(&self, session_id: &str) -> StoreResult<Vec<ChatMessage>>;

    /// Append a message under a caller-generated id
    async fn append_message(
        &self,
        session_id: &str,
        message_id: &str,
        message: &NewMessage,
    ) -> StoreResult<ChatMessage>;

    /// Record a buttons answer on a stored message
    async fn update_interactive(
        &self,
        message_id: &str,
        interactive: &InteractiveContent,
    ) -> StoreResult<()>;

    async fn rename_session(&self, id: &str, title: &str) -> StoreResult<()>;

    async fn delete_session(&self, id: &str) -> StoreResult<()>;
}

/// Opens streaming calls to the agent
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Start a call. Failures after the call is open arrive as stream items.
    async fn open(&self, request: &StreamRequest) -> Result<EventStream, TransportError>;
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: SessionStore + ?Sized> SessionStore for Arc<T> {
    async fn create_session(&self, title: Option<&str>) -> StoreResult<Session> {
        (**self).create_session(title).await
    }

    async fn list_sessions(&self, filter: &SessionFilter) -> StoreResult<Vec<Session>> {
        (**self).list_sessions(filter).await
    }

    async fn get_session(&self, id: &str) -> StoreResult<Session> {
        (**self).get_session(id).await
    }

    async fn get_messages(&self, session_id: &str) -> StoreResult<Vec<ChatMessage>> {
        (**self).get_messages(session_id).await
    }

    async fn append_message(
        &self,
        session_id: &str,
        message_id: &str,
        message: &NewMessage,
    ) -> StoreResult<ChatMessage> {
        (**self).append_message(session_id, message_id, message).await
    }

    async fn update_interactive(
        &self,
        message_id: &str,
        interactive: &InteractiveContent,
    ) -> StoreResult<()> {
        (**self).update_interactive(message_id, interactive).await
    }

    async fn rename_session(&self, id: &str, title: &str) -> StoreResult<()> {
        (**self).rename_session(id, title).await
    }

    async fn delete_session(&self, id: &str) -> StoreResult<()> {
        (**self).delete_session(id).await
    }
}

#[async_trait]
impl<T: StreamTransport + ?Sized> StreamTransport for Arc<T> {
    async fn open(&self, request: &StreamRequest) -> Result<EventStream, TransportError> {
        (**self).open(request).await
    }
}

// ============================================================================
// Production Adapters
// ============================================================================

/// Adapter to use Database as a `SessionStore`
#[derive(Clone)]
pub struct DatabaseStorage {
    db: Database,
}

impl DatabaseStorage {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl SessionStore for DatabaseStorage {
    async fn create_session(&self, title: Option<&str>) -> StoreResult<Session> {
        self.db.create_session(title.unwrap_or(DEFAULT_TITLE))
    }

    async fn list_sessions(&self, filter: &SessionFilter) -> StoreResult<Vec<Session>> {
        self.db.list_sessions(filter)
    }

    async fn get_session(&self, id: &str) -> StoreResult<Session> {
        self.db.get_session(id)
    }

    async fn get_messages(&self, session_id: &str) -> StoreResult<Vec<ChatMessage>> {
        self.db.get_messages(session_id)
    }

    async fn append_message(
        &self,
        session_id: &str,
        message_id: &str,
        message: &NewMessage,
    ) -> StoreResult<ChatMessage> {
        self.db.add_message(message_id, session_id, message)
    }

    async fn update_interactive(
        &self,
        message_id: &str,
        interactive: &InteractiveContent,
    ) -> StoreResult<()> {
        self.db.update_interactive(message_id, interactive)
    }

    async fn rename_session(&self, id: &str, title: &str) -> StoreResult<()> {
        self.db.rename_session(id, title)
    }

    async fn delete_session(&self, id: &str) -> StoreResult<()> {
        self.db.delete_session(id)
    }
}
