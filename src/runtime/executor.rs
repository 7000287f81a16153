//! Conversation engine executor
//!
//! Owns the conversation state and drives it through the pure transition
//! function. Streaming calls run as background tasks that feed their events
//! back over a channel, tagged with the generation of the turn that opened
//! them so events of an abandoned call are dropped.

use super::continuity;
use super::traits::{SessionStore, StreamTransport};
use super::{Command, EngineSnapshot, EngineUpdate};
use crate::db::{ChatMessage, ErrorKind, NewMessage, Session, StoreError};
use crate::gate::{FieldValues, GateView};
use crate::protocol::{InteractiveElement, ProtocolError, StreamRequest};
use crate::state_machine::{transition, ConvState, Effect, Event, TransitionError};
use crate::title::title_from_message;
use futures::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

const STREAM_ENDED_MESSAGE: &str =
    "A conexão com o assistente foi encerrada antes do fim da resposta";

/// Errors returned to callers of engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    /// The operation is not valid in the current state
    #[error(transparent)]
    Rejected(#[from] TransitionError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Message not found: {0}")]
    MessageNotFound(String),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
    #[error("Conversation engine stopped")]
    EngineStopped,
}

impl EngineError {
    fn from_store(error: StoreError, session_id: &str) -> Self {
        match error {
            StoreError::SessionNotFound(_) => EngineError::SessionNotFound(session_id.to_string()),
            other => EngineError::Store(other),
        }
    }
}

/// Event of a streaming call, tagged with the turn that opened it
#[derive(Debug)]
struct StreamEnvelope {
    generation: u64,
    event: Event,
}

/// Single owner of the conversation state
pub struct ConversationEngine<S, T>
where
    S: SessionStore + 'static,
    T: StreamTransport + 'static,
{
    state: ConvState,
    session: Option<Session>,
    messages: Vec<ChatMessage>,
    store: S,
    transport: Arc<T>,
    /// Bumped whenever a call is opened or abandoned
    generation: u64,
    stream_task: Option<JoinHandle<()>>,
    stream_tx: mpsc::Sender<StreamEnvelope>,
    stream_rx: mpsc::Receiver<StreamEnvelope>,
    broadcast_tx: broadcast::Sender<EngineUpdate>,
    /// Last-session continuity runs at most once
    resumed: bool,
}

impl<S, T> ConversationEngine<S, T>
where
    S: SessionStore + 'static,
    T: StreamTransport + 'static,
{
    pub fn new(store: S, transport: T) -> Self {
        let (stream_tx, stream_rx) = mpsc::channel(64);
        let (broadcast_tx, _) = broadcast::channel(256);
        Self {
            state: ConvState::Idle,
            session: None,
            messages: Vec::new(),
            store,
            transport: Arc::new(transport),
            generation: 0,
            stream_task: None,
            stream_tx,
            stream_rx,
            broadcast_tx,
            resumed: false,
        }
    }

    #[allow(dead_code)] // Used in tests
    pub fn state(&self) -> &ConvState {
        &self.state
    }

    #[allow(dead_code)] // Used in tests
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    #[allow(dead_code)] // Used in tests
    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    #[allow(dead_code)] // Used in tests
    pub fn subscribe(&self) -> broadcast::Receiver<EngineUpdate> {
        self.broadcast_tx.subscribe()
    }

    pub(super) fn broadcaster(&self) -> broadcast::Sender<EngineUpdate> {
        self.broadcast_tx.clone()
    }

    /// Everything an observer needs to render the conversation
    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            state: self.state.clone(),
            session: self.session.clone(),
            messages: self.messages.clone(),
            streaming_text: self.state.streaming_text().map(String::from),
            is_loading: self.state.is_in_flight(),
            accepts_input: self.state.accepts_input(),
            gate: GateView::from_gate(self.state.gate()),
            error: match &self.state {
                ConvState::Error { message, .. } => Some(message.clone()),
                _ => None,
            },
        }
    }

    // ==================== User operations ====================

    pub async fn send_message(&mut self, text: &str) -> Result<(), EngineError> {
        self.dispatch(Event::user_message(text)).await
    }

    pub async fn confirm(&mut self) -> Result<(), EngineError> {
        self.dispatch(Event::Confirm).await
    }

    pub async fn reject(&mut self) -> Result<(), EngineError> {
        self.dispatch(Event::Reject).await
    }

    /// Submit form values. Validation failures come back as
    /// `Rejected(Validation(..))` and leave the request open.
    pub async fn submit_data(&mut self, values: FieldValues) -> Result<(), EngineError> {
        self.dispatch(Event::SubmitData { values }).await
    }

    pub async fn cancel_data(&mut self) -> Result<(), EngineError> {
        self.dispatch(Event::CancelData).await
    }

    pub async fn clear_error(&mut self) -> Result<(), EngineError> {
        self.dispatch(Event::ClearError).await
    }

    /// Answer a buttons element and send the chosen label as a user message
    pub async fn choose_option(
        &mut self,
        message_id: &str,
        element_index: usize,
        value: &str,
    ) -> Result<(), EngineError> {
        let position = self
            .messages
            .iter()
            .position(|m| m.id == message_id)
            .ok_or_else(|| EngineError::MessageNotFound(message_id.to_string()))?;

        let mut interactive = self.messages[position].interactive.clone();
        let label = match interactive.get_mut(element_index) {
            Some(InteractiveElement::Buttons(buttons)) => buttons.select(value)?.label.clone(),
            Some(_) => return Err(ProtocolError::NotButtons(element_index).into()),
            None => return Err(ProtocolError::NoSuchElement(element_index).into()),
        };

        self.dispatch(Event::user_message(label)).await?;

        self.messages[position].interactive.clone_from(&interactive);
        let _ = self.broadcast_tx.send(EngineUpdate::MessageUpdated {
            message: self.messages[position].clone(),
        });
        if self.session.is_some() {
            if let Err(e) = self.store.update_interactive(message_id, &interactive).await {
                tracing::warn!(
                    message_id = %message_id,
                    error = %e,
                    "Failed to persist button answer"
                );
            }
        }
        Ok(())
    }

    // ==================== Session operations ====================

    /// Drop the active session and any call in flight
    pub fn start_new_session(&mut self) {
        self.abandon_stream();
        self.log_discarded_gate();
        self.messages.clear();
        self.state = ConvState::Idle;
        self.set_session(None);
        self.broadcast_state();
        tracing::info!("Started new session");
    }

    fn log_discarded_gate(&self) {
        if self.state.gate().is_open() {
            tracing::info!(state = self.state.name(), "Discarding open gate on session switch");
        }
    }

    /// Replace the conversation wholesale with a stored session.
    ///
    /// Unknown ids fail with `SessionNotFound` and leave the engine as it was.
    pub async fn load_session(&mut self, session_id: &str) -> Result<(), EngineError> {
        let session = self
            .store
            .get_session(session_id)
            .await
            .map_err(|e| EngineError::from_store(e, session_id))?;
        let messages = self
            .store
            .get_messages(session_id)
            .await
            .map_err(|e| EngineError::from_store(e, session_id))?;

        self.abandon_stream();
        self.log_discarded_gate();
        tracing::info!(session_id = %session_id, messages = messages.len(), "Loaded session");
        self.messages = messages;
        self.state = ConvState::Idle;
        self.set_session(Some(session));
        self.broadcast_state();
        Ok(())
    }

    /// Append a message from outside the streaming flow.
    ///
    /// Creates a session titled after the message when none is active.
    /// Tool messages stay in memory only. The message is shown only once
    /// the store accepted it.
    pub async fn add_message(&mut self, message: NewMessage) -> Result<ChatMessage, EngineError> {
        let local = message.clone().into_message(&uuid::Uuid::new_v4().to_string());
        if message.role.is_persisted() {
            let session_id = match &self.session {
                Some(session) => session.id.clone(),
                None => {
                    let title = title_from_message(&message.content);
                    let session = self.store.create_session(Some(&title)).await?;
                    tracing::info!(
                        session_id = %session.id,
                        "Created session for appended message"
                    );
                    self.persist_unsaved(&session.id).await;
                    let id = session.id.clone();
                    self.set_session(Some(session));
                    id
                }
            };
            self.store
                .append_message(&session_id, &local.id, &message)
                .await
                .map_err(|e| EngineError::from_store(e, &session_id))?;
        }
        self.show(local.clone());
        Ok(local)
    }

    pub async fn rename_session(
        &mut self,
        session_id: &str,
        title: &str,
    ) -> Result<(), EngineError> {
        self.store
            .rename_session(session_id, title)
            .await
            .map_err(|e| EngineError::from_store(e, session_id))?;

        if self.session.as_ref().is_some_and(|s| s.id == session_id) {
            let session = self
                .store
                .get_session(session_id)
                .await
                .map_err(|e| EngineError::from_store(e, session_id))?;
            self.set_session(Some(session));
        }
        Ok(())
    }

    /// Delete a stored session; deleting the active one starts a new session
    pub async fn delete_session(&mut self, session_id: &str) -> Result<(), EngineError> {
        self.store
            .delete_session(session_id)
            .await
            .map_err(|e| EngineError::from_store(e, session_id))?;

        if self.session.as_ref().is_some_and(|s| s.id == session_id) {
            self.start_new_session();
        }
        Ok(())
    }

    /// Adopt the most recently updated session on first activation.
    ///
    /// Returns whether a session was restored. Only the first call does
    /// anything, and only while the engine is still empty.
    pub async fn resume_last_session(&mut self) -> bool {
        if std::mem::replace(&mut self.resumed, true) {
            return false;
        }
        if self.session.is_some() || !self.messages.is_empty() {
            return false;
        }
        let Some((session, messages)) = continuity::load_most_recent(&self.store).await else {
            return false;
        };

        tracing::info!(session_id = %session.id, messages = messages.len(), "Resumed last session");
        self.messages = messages;
        self.set_session(Some(session));
        true
    }

    // ==================== Event loop ====================

    /// Serve commands until every handle is dropped
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        tracing::info!("Starting conversation engine");
        self.resume_last_session().await;

        loop {
            tokio::select! {
                Some(envelope) = self.stream_rx.recv() => {
                    self.apply_stream(envelope).await;
                }
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
            }
        }

        self.abandon_stream();
        tracing::info!("Conversation engine stopped");
    }

    /// Wait for the next event of a streaming call and apply it.
    ///
    /// Returns false when the event belonged to an abandoned call.
    #[allow(dead_code)] // Used in tests
    pub async fn pump(&mut self) -> bool {
        match self.stream_rx.recv().await {
            Some(envelope) => self.apply_stream(envelope).await,
            None => false,
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SendMessage { text, reply } => {
                let _ = reply.send(self.send_message(&text).await);
            }
            Command::Confirm { reply } => {
                let _ = reply.send(self.confirm().await);
            }
            Command::Reject { reply } => {
                let _ = reply.send(self.reject().await);
            }
            Command::SubmitData { values, reply } => {
                let _ = reply.send(self.submit_data(values).await);
            }
            Command::CancelData { reply } => {
                let _ = reply.send(self.cancel_data().await);
            }
            Command::ClearError { reply } => {
                let _ = reply.send(self.clear_error().await);
            }
            Command::ChooseOption {
                message_id,
                element_index,
                value,
                reply,
            } => {
                let result = self.choose_option(&message_id, element_index, &value).await;
                let _ = reply.send(result);
            }
            Command::NewSession { reply } => {
                self.start_new_session();
                let _ = reply.send(Ok(()));
            }
            Command::LoadSession { session_id, reply } => {
                let _ = reply.send(self.load_session(&session_id).await);
            }
            Command::AddMessage { message, reply } => {
                let _ = reply.send(self.add_message(message).await);
            }
            Command::RenameSession {
                session_id,
                title,
                reply,
            } => {
                let _ = reply.send(self.rename_session(&session_id, &title).await);
            }
            Command::DeleteSession { session_id, reply } => {
                let _ = reply.send(self.delete_session(&session_id).await);
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(Ok(self.snapshot()));
            }
        }
    }

    async fn apply_stream(&mut self, envelope: StreamEnvelope) -> bool {
        if envelope.generation != self.generation {
            tracing::debug!(
                generation = envelope.generation,
                current = self.generation,
                "Dropping event from abandoned call"
            );
            return false;
        }
        if let Err(e) = self.dispatch(envelope.event).await {
            tracing::warn!(error = %e, "Stream event rejected");
        }
        true
    }

    // ==================== Transitions and effects ====================

    async fn dispatch(&mut self, event: Event) -> Result<(), EngineError> {
        let from_transport = event.is_transport();
        let result = transition(&self.state, event).map_err(|e| {
            if from_transport {
                tracing::warn!(state = self.state.name(), error = %e, "Transport event rejected");
            }
            e
        })?;

        let old_state = std::mem::replace(&mut self.state, result.new_state);
        if old_state.name() != self.state.name() {
            tracing::debug!(from = old_state.name(), to = self.state.name(), "State change");
            self.broadcast_state();
        }

        for effect in result.effects {
            self.execute_effect(effect).await?;
        }
        Ok(())
    }

    async fn execute_effect(&mut self, effect: Effect) -> Result<(), EngineError> {
        match effect {
            Effect::EnsureSession { first_message } => {
                if self.session.is_some() {
                    return Ok(());
                }
                let title = title_from_message(&first_message);
                match self.store.create_session(Some(&title)).await {
                    Ok(session) => {
                        tracing::info!(
                            session_id = %session.id,
                            title = %session.title,
                            "Created session"
                        );
                        self.persist_unsaved(&session.id).await;
                        self.set_session(Some(session));
                        Ok(())
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to create session");
                        self.state = ConvState::Error {
                            message: format!("Não foi possível salvar a conversa: {e}"),
                            error_kind: ErrorKind::Persistence,
                        };
                        self.broadcast_state();
                        Err(e.into())
                    }
                }
            }

            Effect::AppendMessage {
                role,
                content,
                interactive,
            } => {
                let message = NewMessage {
                    role,
                    content,
                    tool_calls: None,
                    interactive,
                };
                if let Err(e) = self.append(message).await {
                    tracing::warn!(role = %role, error = %e, "Failed to persist message");
                }
                Ok(())
            }

            Effect::OpenStream {
                messages,
                confirmation,
            } => {
                let request = StreamRequest {
                    messages,
                    session_id: self.session.as_ref().map(|s| s.id.clone()),
                    confirmation,
                };
                self.open_stream(request);
                Ok(())
            }

            Effect::AttachSession { session_id } => {
                self.attach_session(&session_id).await;
                Ok(())
            }

            Effect::NotifyToken { text } => {
                let _ = self.broadcast_tx.send(EngineUpdate::Token { text });
                Ok(())
            }

            Effect::NotifyToolStart { name } => {
                tracing::info!(tool = %name, "Agent started tool");
                let _ = self.broadcast_tx.send(EngineUpdate::ToolStarted { name });
                Ok(())
            }

            Effect::NotifyTurnComplete => {
                let _ = self.broadcast_tx.send(EngineUpdate::TurnComplete);
                Ok(())
            }
        }
    }

    /// Show a message immediately, then persist it when it belongs to a
    /// session. Messages shown before a session exists are saved when the
    /// session is created.
    async fn append(&mut self, message: NewMessage) -> Result<ChatMessage, StoreError> {
        let local = message.clone().into_message(&uuid::Uuid::new_v4().to_string());
        self.show(local.clone());

        if !message.role.is_persisted() {
            return Ok(local);
        }
        let Some(session) = &self.session else {
            tracing::debug!("No active session, message kept in memory");
            return Ok(local);
        };
        self.store.append_message(&session.id, &local.id, &message).await?;
        Ok(local)
    }

    fn show(&mut self, message: ChatMessage) {
        self.messages.push(message.clone());
        let _ = self.broadcast_tx.send(EngineUpdate::Message { message });
    }

    /// Save the in-memory conversation into a freshly created session
    async fn persist_unsaved(&self, session_id: &str) {
        for message in self.messages.iter().filter(|m| m.role.is_persisted()) {
            let new = NewMessage::from(message);
            if let Err(e) = self.store.append_message(session_id, &message.id, &new).await {
                tracing::warn!(
                    session_id = %session_id,
                    message_id = %message.id,
                    error = %e,
                    "Failed to persist message"
                );
            }
        }
    }

    fn open_stream(&mut self, request: StreamRequest) {
        self.abandon_stream();
        let generation = self.generation;
        let transport = self.transport.clone();
        let stream_tx = self.stream_tx.clone();

        let task = tokio::spawn(async move {
            tracing::info!(
                generation,
                resumption = request.is_resumption(),
                "Opening streaming call (background)"
            );
            let failure = move |message: String| StreamEnvelope {
                generation,
                event: Event::TransportFailed { message },
            };

            let mut events = match transport.open(&request).await {
                Ok(events) => events,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to open streaming call");
                    let _ = stream_tx.send(failure(e.to_string())).await;
                    return;
                }
            };

            while let Some(item) = events.next().await {
                match item {
                    Ok(event) => {
                        let terminal = event.is_terminal();
                        if terminal {
                            tracing::info!(
                                generation,
                                kind = event.kind(),
                                "Streaming call finished"
                            );
                        }
                        let envelope = StreamEnvelope {
                            generation,
                            event: Event::Stream(event),
                        };
                        if stream_tx.send(envelope).await.is_err() || terminal {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Streaming call failed");
                        let _ = stream_tx.send(failure(e.to_string())).await;
                        return;
                    }
                }
            }

            tracing::warn!("Streaming call ended without a terminal event");
            let _ = stream_tx.send(failure(STREAM_ENDED_MESSAGE.to_string())).await;
        });
        self.stream_task = Some(task);
    }

    /// Stop listening to the current call; its late events are dropped
    fn abandon_stream(&mut self) {
        self.generation += 1;
        if let Some(task) = self.stream_task.take() {
            task.abort();
        }
    }

    async fn attach_session(&mut self, session_id: &str) {
        match &self.session {
            Some(current) if current.id == session_id => {}
            Some(current) => {
                tracing::warn!(
                    current = %current.id,
                    reported = %session_id,
                    "Agent reported a different session, keeping the active one"
                );
            }
            None => match self.store.get_session(session_id).await {
                Ok(session) => {
                    tracing::info!(session_id = %session_id, "Attached session reported by agent");
                    self.set_session(Some(session));
                }
                Err(e) => {
                    tracing::warn!(
                        session_id = %session_id,
                        error = %e,
                        "Agent reported unknown session"
                    );
                }
            },
        }
    }

    fn set_session(&mut self, session: Option<Session>) {
        self.session = session;
        let _ = self.broadcast_tx.send(EngineUpdate::SessionChanged {
            session: self.session.clone(),
            messages: self.messages.clone(),
        });
    }

    fn broadcast_state(&self) {
        let _ = self.broadcast_tx.send(EngineUpdate::StateChange {
            state: self.state.clone(),
        });
        if let ConvState::Error { message, .. } = &self.state {
            let _ = self.broadcast_tx.send(EngineUpdate::Error {
                message: message.clone(),
            });
        }
    }
}
