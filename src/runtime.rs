//! Runtime for the conversation engine
//!
//! The engine runs as a single task. Callers talk to it through an
//! [`EngineHandle`] (commands with oneshot replies) and observe it through
//! a broadcast of [`EngineUpdate`]s.

mod continuity;
mod executor;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use executor::{ConversationEngine, EngineError};
pub use traits::*;

use crate::db::{ChatMessage, NewMessage, Session};
use crate::gate::{FieldValues, GateView};
use crate::state_machine::ConvState;
use crate::transport::HttpTransport;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};

/// Type alias for the production engine with concrete implementations
pub type ProductionEngine = ConversationEngine<DatabaseStorage, HttpTransport>;

type Reply<T> = oneshot::Sender<Result<T, EngineError>>;

/// Requests served by the engine task
#[derive(Debug)]
pub enum Command {
    SendMessage {
        text: String,
        reply: Reply<()>,
    },
    Confirm {
        reply: Reply<()>,
    },
    Reject {
        reply: Reply<()>,
    },
    SubmitData {
        values: FieldValues,
        reply: Reply<()>,
    },
    CancelData {
        reply: Reply<()>,
    },
    ClearError {
        reply: Reply<()>,
    },
    ChooseOption {
        message_id: String,
        element_index: usize,
        value: String,
        reply: Reply<()>,
    },
    NewSession {
        reply: Reply<()>,
    },
    LoadSession {
        session_id: String,
        reply: Reply<()>,
    },
    AddMessage {
        message: NewMessage,
        reply: Reply<ChatMessage>,
    },
    RenameSession {
        session_id: String,
        title: String,
        reply: Reply<()>,
    },
    DeleteSession {
        session_id: String,
        reply: Reply<()>,
    },
    Snapshot {
        reply: Reply<EngineSnapshot>,
    },
}

/// Updates sent to observers
#[derive(Debug, Clone)]
pub enum EngineUpdate {
    StateChange {
        state: ConvState,
    },
    /// A message was appended
    Message {
        message: ChatMessage,
    },
    /// A stored message changed (button answered)
    MessageUpdated {
        message: ChatMessage,
    },
    Token {
        text: String,
    },
    ToolStarted {
        name: String,
    },
    /// The active session was replaced; `messages` is the new conversation
    SessionChanged {
        session: Option<Session>,
        messages: Vec<ChatMessage>,
    },
    TurnComplete,
    Error {
        message: String,
    },
}

/// Full observable state of the engine
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub state: ConvState,
    pub session: Option<Session>,
    pub messages: Vec<ChatMessage>,
    /// Text of the reply being streamed, not yet a message
    pub streaming_text: Option<String>,
    pub is_loading: bool,
    /// Whether a typed message would be accepted now
    pub accepts_input: bool,
    pub gate: Option<GateView>,
    pub error: Option<String>,
}

/// Handle to interact with the running engine
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    broadcast_tx: broadcast::Sender<EngineUpdate>,
}

impl EngineHandle {
    /// Start the engine task. It resumes the last session before serving
    /// commands and stops when every handle is dropped.
    pub fn spawn<S, T>(engine: ConversationEngine<S, T>) -> Self
    where
        S: SessionStore + 'static,
        T: StreamTransport + 'static,
    {
        let (commands, commands_rx) = mpsc::channel(32);
        let broadcast_tx = engine.broadcaster();
        tokio::spawn(engine.run(commands_rx));
        Self {
            commands,
            broadcast_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineUpdate> {
        self.broadcast_tx.subscribe()
    }

    async fn request<R>(
        &self,
        build: impl FnOnce(Reply<R>) -> Command,
    ) -> Result<R, EngineError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .await
            .map_err(|_| EngineError::EngineStopped)?;
        response.await.map_err(|_| EngineError::EngineStopped)?
    }

    pub async fn send_message(&self, text: String) -> Result<(), EngineError> {
        self.request(|reply| Command::SendMessage { text, reply }).await
    }

    pub async fn confirm(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::Confirm { reply }).await
    }

    pub async fn reject(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::Reject { reply }).await
    }

    pub async fn submit_data(&self, values: FieldValues) -> Result<(), EngineError> {
        self.request(|reply| Command::SubmitData { values, reply }).await
    }

    pub async fn cancel_data(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::CancelData { reply }).await
    }

    pub async fn clear_error(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::ClearError { reply }).await
    }

    pub async fn choose_option(
        &self,
        message_id: String,
        element_index: usize,
        value: String,
    ) -> Result<(), EngineError> {
        self.request(|reply| Command::ChooseOption {
            message_id,
            element_index,
            value,
            reply,
        })
        .await
    }

    pub async fn new_session(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::NewSession { reply }).await
    }

    pub async fn load_session(&self, session_id: String) -> Result<(), EngineError> {
        self.request(|reply| Command::LoadSession { session_id, reply })
            .await
    }

    pub async fn add_message(&self, message: NewMessage) -> Result<ChatMessage, EngineError> {
        self.request(|reply| Command::AddMessage { message, reply })
            .await
    }

    pub async fn rename_session(
        &self,
        session_id: String,
        title: String,
    ) -> Result<(), EngineError> {
        self.request(|reply| Command::RenameSession {
            session_id,
            title,
            reply,
        })
        .await
    }

    pub async fn delete_session(&self, session_id: String) -> Result<(), EngineError> {
        self.request(|reply| Command::DeleteSession { session_id, reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<EngineSnapshot, EngineError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }
}
