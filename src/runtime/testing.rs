//! Mock implementations for testing
//!
//! These mocks enable integration testing without real I/O.

use super::traits::*;
use super::ConversationEngine;
use crate::db::{ChatMessage, NewMessage, Session, SessionFilter, StoreError, StoreResult};
use crate::protocol::{InteractiveContent, StreamEvent, StreamRequest};
use crate::title::{session_preview, DEFAULT_TITLE};
use crate::transport::TransportError;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

// ============================================================================
// Mock Transport
// ============================================================================

enum ScriptedStream {
    Events(Vec<Result<StreamEvent, TransportError>>),
    OpenFailure(TransportError),
    Channel(mpsc::UnboundedReceiver<Result<StreamEvent, TransportError>>),
}

/// Mock transport that replays queued streams, one per call
#[derive(Default)]
pub struct MockTransport {
    streams: Mutex<VecDeque<ScriptedStream>>,
    /// Record of all calls opened
    pub requests: Mutex<Vec<StreamRequest>>,
}

#[allow(dead_code)]
impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a call that yields these events, then ends
    pub fn queue_events(&self, events: Vec<StreamEvent>) {
        self.queue_results(events.into_iter().map(Ok).collect());
    }

    /// Queue a call that yields these items, failures included
    pub fn queue_results(&self, items: Vec<Result<StreamEvent, TransportError>>) {
        self.streams
            .lock()
            .unwrap()
            .push_back(ScriptedStream::Events(items));
    }

    /// Queue a call that cannot be opened
    pub fn queue_failure(&self, error: TransportError) {
        self.streams
            .lock()
            .unwrap()
            .push_back(ScriptedStream::OpenFailure(error));
    }

    /// Queue a call whose events the test pushes by hand
    pub fn queue_channel(&self) -> mpsc::UnboundedSender<Result<StreamEvent, TransportError>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams
            .lock()
            .unwrap()
            .push_back(ScriptedStream::Channel(rx));
        tx
    }

    /// Get recorded requests
    pub fn recorded_requests(&self) -> Vec<StreamRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl StreamTransport for MockTransport {
    async fn open(&self, request: &StreamRequest) -> Result<EventStream, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        let scripted = self.streams.lock().unwrap().pop_front();
        match scripted {
            Some(ScriptedStream::Events(items)) => Ok(Box::pin(futures::stream::iter(items))),
            Some(ScriptedStream::OpenFailure(error)) => Err(error),
            Some(ScriptedStream::Channel(rx)) => Ok(Box::pin(UnboundedReceiverStream::new(rx))),
            None => Err(TransportError::Connect("No mock stream queued".to_string())),
        }
    }
}

// ============================================================================
// In-Memory Storage
// ============================================================================

/// In-memory session store
#[derive(Default)]
pub struct InMemoryStorage {
    sessions: Mutex<Vec<Session>>,
    messages: Mutex<HashMap<String, Vec<ChatMessage>>>,
}

#[allow(dead_code)]
impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all messages of a session (test helper)
    pub fn get_all_messages(&self, session_id: &str) -> Vec<ChatMessage> {
        self.messages
            .lock()
            .unwrap()
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    fn session_exists(&self, id: &str) -> bool {
        self.sessions.lock().unwrap().iter().any(|s| s.id == id)
    }
}

#[async_trait]
impl SessionStore for InMemoryStorage {
    async fn create_session(&self, title: Option<&str>) -> StoreResult<Session> {
        let now = Utc::now();
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.unwrap_or(DEFAULT_TITLE).to_string(),
            last_message_preview: None,
            created_at: now,
            updated_at: now,
        };
        self.sessions.lock().unwrap().push(session.clone());
        Ok(session)
    }

    async fn list_sessions(&self, filter: &SessionFilter) -> StoreResult<Vec<Session>> {
        // Newest insertion first so equal timestamps keep creation order
        let mut sessions: Vec<Session> = self
            .sessions
            .lock()
            .unwrap()
            .iter()
            .rev()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        sessions.sort_by_key(|s| std::cmp::Reverse(s.updated_at));
        if let Some(limit) = filter.limit {
            sessions.truncate(limit as usize);
        }
        Ok(sessions)
    }

    async fn get_session(&self, id: &str) -> StoreResult<Session> {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.id == id)
            .cloned()
            .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))
    }

    async fn get_messages(&self, session_id: &str) -> StoreResult<Vec<ChatMessage>> {
        if !self.session_exists(session_id) {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }
        Ok(self.get_all_messages(session_id))
    }

    async fn append_message(
        &self,
        session_id: &str,
        message_id: &str,
        message: &NewMessage,
    ) -> StoreResult<ChatMessage> {
        if !message.role.is_persisted() {
            return Err(StoreError::TransientRole(message.role));
        }
        let saved = message.clone().into_message(message_id);
        {
            let mut sessions = self.sessions.lock().unwrap();
            let session = sessions
                .iter_mut()
                .find(|s| s.id == session_id)
                .ok_or_else(|| StoreError::SessionNotFound(session_id.to_string()))?;
            session.updated_at = saved.created_at;
            if let Some(preview) = session_preview(&saved.content, &saved.interactive) {
                session.last_message_preview = Some(preview);
            }
        }
        self.messages
            .lock()
            .unwrap()
            .entry(session_id.to_string())
            .or_default()
            .push(saved.clone());
        Ok(saved)
    }

    async fn update_interactive(
        &self,
        message_id: &str,
        interactive: &InteractiveContent,
    ) -> StoreResult<()> {
        let mut messages = self.messages.lock().unwrap();
        for msgs in messages.values_mut() {
            for msg in msgs.iter_mut() {
                if msg.id == message_id {
                    msg.interactive.clone_from(interactive);
                    return Ok(());
                }
            }
        }
        Err(StoreError::MessageNotFound(message_id.to_string()))
    }

    async fn rename_session(&self, id: &str, title: &str) -> StoreResult<()> {
        let title = title.trim();
        if title.is_empty() {
            return Err(StoreError::InvalidTitle);
        }
        let mut sessions = self.sessions.lock().unwrap();
        let session = sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| StoreError::SessionNotFound(id.to_string()))?;
        session.title = title.to_string();
        Ok(())
    }

    async fn delete_session(&self, id: &str) -> StoreResult<()> {
        let mut sessions = self.sessions.lock().unwrap();
        let before = sessions.len();
        sessions.retain(|s| s.id != id);
        if sessions.len() == before {
            return Err(StoreError::SessionNotFound(id.to_string()));
        }
        self.messages.lock().unwrap().remove(id);
        Ok(())
    }
}

// ============================================================================
// Failing Storage
// ============================================================================

/// Store whose every operation fails, as if the disk were full
pub struct FailingStorage;

fn disk_full() -> StoreError {
    StoreError::Sqlite(rusqlite::Error::SqliteFailure(
        rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_FULL),
        Some("database or disk is full".to_string()),
    ))
}

#[async_trait]
impl SessionStore for FailingStorage {
    async fn create_session(&self, _title: Option<&str>) -> StoreResult<Session> {
        Err(disk_full())
    }

    async fn list_sessions(&self, _filter: &SessionFilter) -> StoreResult<Vec<Session>> {
        Err(disk_full())
    }

    async fn get_session(&self, _id: &str) -> StoreResult<Session> {
        Err(disk_full())
    }

    async fn get_messages(&self, _session_id: &str) -> StoreResult<Vec<ChatMessage>> {
        Err(disk_full())
    }

    async fn append_message(
        &self,
        _session_id: &str,
        _message_id: &str,
        _message: &NewMessage,
    ) -> StoreResult<ChatMessage> {
        Err(disk_full())
    }

    async fn update_interactive(
        &self,
        _message_id: &str,
        _interactive: &InteractiveContent,
    ) -> StoreResult<()> {
        Err(disk_full())
    }

    async fn rename_session(&self, _id: &str, _title: &str) -> StoreResult<()> {
        Err(disk_full())
    }

    async fn delete_session(&self, _id: &str) -> StoreResult<()> {
        Err(disk_full())
    }
}

// ============================================================================
// Test Engine
// ============================================================================

/// Engine wired to in-memory mocks
pub type TestEngine = ConversationEngine<Arc<InMemoryStorage>, Arc<MockTransport>>;

/// Create an engine plus handles on its mocks
pub fn test_engine() -> (TestEngine, Arc<InMemoryStorage>, Arc<MockTransport>) {
    let store = Arc::new(InMemoryStorage::new());
    let transport = Arc::new(MockTransport::new());
    let engine = ConversationEngine::new(store.clone(), transport.clone());
    (engine, store, transport)
}

impl<S, T> ConversationEngine<S, T>
where
    S: SessionStore + 'static,
    T: StreamTransport + 'static,
{
    /// Apply stream events until no call is in flight
    pub async fn settle(&mut self) {
        let settled = tokio::time::timeout(Duration::from_secs(2), async {
            while self.state().is_in_flight() {
                self.pump().await;
            }
        })
        .await;
        assert!(settled.is_ok(), "Engine still in flight: {:?}", self.state());
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{ErrorKind, Role};
    use crate::gate::{
        ActionType, DataRequest, FieldValues, PendingAction, DATA_CANCELLED_MESSAGE,
        SUBMISSION_PREFIX,
    };
    use crate::protocol::{InteractiveElement, ProtocolError};
    use crate::runtime::{EngineError, EngineHandle, EngineUpdate};
    use crate::state_machine::{ConvState, TransitionError};
    use serde_json::json;
    use tokio::sync::broadcast;

    fn expense_action() -> PendingAction {
        serde_json::from_value(json!({
            "id": "tok-123",
            "action_type": "create_transaction",
            "action_data": {"tipo": "despesa", "valor": 50, "descricao": "Despesa"}
        }))
        .unwrap()
    }

    fn expense_request() -> DataRequest {
        serde_json::from_value(json!({
            "context": "Preciso do valor da despesa",
            "fields": [
                {"name": "valor", "label": "Valor", "type": "currency", "required": true},
                {"name": "descricao", "label": "Descrição", "type": "text"}
            ]
        }))
        .unwrap()
    }

    fn category_buttons() -> InteractiveElement {
        serde_json::from_value(json!({
            "type": "buttons",
            "question": "Que tipo de transação?",
            "options": [
                {"value": "despesa", "label": "Despesa"},
                {"value": "receita", "label": "Receita"}
            ]
        }))
        .unwrap()
    }

    fn state_names(rx: &mut broadcast::Receiver<EngineUpdate>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(update) = rx.try_recv() {
            if let EngineUpdate::StateChange { state } = update {
                names.push(state.name());
            }
        }
        names
    }

    /// Wait for `TurnComplete` with timeout
    async fn wait_for_turn(rx: &mut broadcast::Receiver<EngineUpdate>, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if let Ok(Ok(EngineUpdate::TurnComplete)) =
                tokio::time::timeout(Duration::from_millis(50), rx.recv()).await
            {
                return true;
            }
        }
        false
    }

    async fn open_data_request(engine: &mut TestEngine, transport: &MockTransport) {
        transport.queue_events(vec![StreamEvent::NeedsData {
            message: "Qual o valor?".to_string(),
            data_request: expense_request(),
        }]);
        engine.send_message("Registrar despesa").await.unwrap();
        engine.settle().await;
        assert_eq!(engine.state().name(), "awaiting_data");
    }

    #[tokio::test]
    async fn test_mock_transport() {
        let transport = MockTransport::new();
        transport.queue_events(vec![StreamEvent::done()]);
        let request = StreamRequest {
            messages: vec![],
            session_id: None,
            confirmation: None,
        };

        assert!(transport.open(&request).await.is_ok());
        // Second call should fail (nothing queued)
        assert!(matches!(
            transport.open(&request).await,
            Err(TransportError::Connect(_))
        ));
        assert_eq!(transport.recorded_requests().len(), 2);
    }

    #[tokio::test]
    async fn test_in_memory_storage() {
        let storage = InMemoryStorage::new();
        let session = storage.create_session(Some("Mercado")).await.unwrap();
        storage
            .append_message(&session.id, "m-1", &NewMessage::text(Role::User, "gastos"))
            .await
            .unwrap();

        let messages = storage.get_messages(&session.id).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, "m-1");

        let hits = storage
            .list_sessions(&SessionFilter {
                search: Some("GASTOS".to_string()),
                ..SessionFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        assert!(matches!(
            storage
                .append_message(&session.id, "m-2", &NewMessage::text(Role::Tool, "x"))
                .await,
            Err(StoreError::TransientRole(Role::Tool))
        ));
        assert!(storage.get_messages("ghost").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_first_message_titles_session() {
        let (mut engine, store, transport) = test_engine();
        transport.queue_events(vec![StreamEvent::done()]);

        engine.send_message(&"a".repeat(80)).await.unwrap();
        engine.settle().await;

        let title = &engine.session().unwrap().title;
        assert!(title.chars().count() <= 50);
        assert!(title.ends_with("..."));

        let (mut engine, _, transport) = test_engine();
        transport.queue_events(vec![StreamEvent::done()]);
        engine.send_message("short").await.unwrap();
        engine.settle().await;
        assert_eq!(engine.session().unwrap().title, "short");

        assert_eq!(store.session_count(), 1);
    }

    #[tokio::test]
    async fn test_confirmation_flow_end_to_end() {
        let (mut engine, store, transport) = test_engine();
        let mut updates = engine.subscribe();

        transport.queue_events(vec![
            StreamEvent::token("Vou registrar "),
            StreamEvent::token("a despesa."),
            StreamEvent::NeedsConfirmation {
                message: "Confirma?".to_string(),
                pending_action: expense_action(),
            },
        ]);
        transport.queue_events(vec![
            StreamEvent::token("Despesa registrada!"),
            StreamEvent::done(),
        ]);

        engine.send_message("Criar uma despesa de R$50").await.unwrap();
        assert_eq!(engine.state().name(), "loading");
        assert_eq!(engine.messages()[0].content, "Criar uma despesa de R$50");
        engine.settle().await;

        match engine.state() {
            ConvState::AwaitingConfirmation { pending_action } => {
                assert_eq!(pending_action.action_type, ActionType::CreateTransaction);
                assert_eq!(pending_action.action_data["valor"], json!(50));
            }
            other => panic!("Expected awaiting_confirmation, got {other:?}"),
        }
        assert_eq!(engine.messages().len(), 2);
        assert_eq!(engine.messages()[1].content, "Vou registrar a despesa.\n\nConfirma?");
        assert!(engine.snapshot().gate.is_some());

        engine.confirm().await.unwrap();
        assert_eq!(engine.state().name(), "loading");
        engine.settle().await;

        assert_eq!(engine.state(), &ConvState::Idle);
        assert_eq!(engine.messages().len(), 3);
        assert_eq!(engine.messages()[2].role, Role::Assistant);
        assert_eq!(engine.messages()[2].content, "Despesa registrada!");

        let requests = transport.recorded_requests();
        assert_eq!(requests.len(), 2);
        let session_id = engine.session().unwrap().id.clone();
        assert_eq!(requests[0].session_id.as_deref(), Some(session_id.as_str()));
        assert!(!requests[0].is_resumption());
        assert!(requests[1].messages.is_empty());
        let payload = requests[1].confirmation.as_ref().unwrap();
        assert_eq!(payload.confirmation_token, "tok-123");
        assert!(payload.confirmed);

        assert_eq!(
            state_names(&mut updates),
            vec![
                "loading",
                "streaming",
                "awaiting_confirmation",
                "loading",
                "streaming",
                "idle"
            ]
        );
        assert_eq!(store.get_all_messages(&session_id).len(), 3);
    }

    #[tokio::test]
    async fn test_reject_with_transport_failure_closes_gate() {
        let (mut engine, _, transport) = test_engine();
        transport.queue_events(vec![StreamEvent::NeedsConfirmation {
            message: String::new(),
            pending_action: expense_action(),
        }]);
        transport.queue_failure(TransportError::Connect("connection refused".to_string()));

        engine.send_message("Excluir a despesa").await.unwrap();
        engine.settle().await;
        engine.reject().await.unwrap();
        engine.settle().await;

        match engine.state() {
            ConvState::Error { error_kind, .. } => assert_eq!(*error_kind, ErrorKind::Network),
            other => panic!("Expected error, got {other:?}"),
        }
        assert!(!engine.state().gate().is_open());
        assert!(!transport.recorded_requests()[1].confirmation.as_ref().unwrap().confirmed);

        engine.clear_error().await.unwrap();
        assert_eq!(engine.state(), &ConvState::Idle);
    }

    #[tokio::test]
    async fn test_session_switch_abandons_call() {
        let (mut engine, store, transport) = test_engine();
        let other = store.create_session(Some("Outra")).await.unwrap();
        store
            .append_message(&other.id, "o-1", &NewMessage::text(Role::User, "pergunta antiga"))
            .await
            .unwrap();

        let tx = transport.queue_channel();
        engine.send_message("Qual meu saldo?").await.unwrap();
        tx.send(Ok(StreamEvent::token("Seu saldo"))).unwrap();
        assert!(engine.pump().await);
        assert_eq!(engine.state().streaming_text(), Some("Seu saldo"));

        engine.load_session(&other.id).await.unwrap();
        assert_eq!(engine.state(), &ConvState::Idle);

        // Late events of the abandoned call never land
        let _ = tx.send(Ok(StreamEvent::token(" é R$ 10")));
        let _ = tx.send(Ok(StreamEvent::done()));
        let late = tokio::time::timeout(Duration::from_millis(200), engine.pump()).await;
        assert!(!matches!(late, Ok(true)));

        assert_eq!(engine.state(), &ConvState::Idle);
        assert_eq!(engine.session().unwrap().id, other.id);
        assert_eq!(engine.messages().len(), 1);
        assert_eq!(engine.messages()[0].content, "pergunta antiga");
    }

    #[tokio::test]
    async fn test_add_message_then_load_roundtrip() {
        let (mut engine, store, transport) = test_engine();

        let user = engine
            .add_message(NewMessage::text(Role::User, "Olá"))
            .await
            .unwrap();
        engine
            .add_message(NewMessage::text(Role::Assistant, "Oi! Como posso ajudar?"))
            .await
            .unwrap();
        engine
            .add_message(NewMessage::text(Role::Tool, "{\"saldo\": 10}"))
            .await
            .unwrap();
        assert_eq!(engine.messages().len(), 3);
        let session = engine.session().unwrap().clone();
        assert_eq!(session.title, "Olá");

        let mut reloaded = ConversationEngine::new(store.clone(), transport.clone());
        reloaded.load_session(&session.id).await.unwrap();
        let messages = reloaded.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].id, user.id);
        assert_eq!(messages[0].content, "Olá");
        assert_eq!(messages[1].role, Role::Assistant);
        assert!(transport.recorded_requests().is_empty());
    }

    #[tokio::test]
    async fn test_load_unknown_session_keeps_state() {
        let (mut engine, _, _) = test_engine();
        engine
            .add_message(NewMessage::text(Role::User, "manter"))
            .await
            .unwrap();
        let session_id = engine.session().unwrap().id.clone();

        let result = engine.load_session("nope").await;
        assert!(matches!(result, Err(EngineError::SessionNotFound(id)) if id == "nope"));
        assert_eq!(engine.session().unwrap().id, session_id);
        assert_eq!(engine.messages().len(), 1);
        assert_eq!(engine.state(), &ConvState::Idle);
    }

    #[tokio::test]
    async fn test_invalid_submission_never_reaches_transport() {
        let (mut engine, _, transport) = test_engine();
        open_data_request(&mut engine, &transport).await;

        let result = engine.submit_data(FieldValues::new()).await;
        match result {
            Err(EngineError::Rejected(TransitionError::Validation(errors))) => {
                assert!(errors.contains_key("valor"));
                assert!(!errors.contains_key("descricao"));
            }
            other => panic!("Expected validation error, got {other:?}"),
        }
        assert_eq!(transport.recorded_requests().len(), 1);
        assert_eq!(engine.state().name(), "awaiting_data");
    }

    #[tokio::test]
    async fn test_submission_continues_turn() {
        let (mut engine, _, transport) = test_engine();
        open_data_request(&mut engine, &transport).await;

        // The agent may ask again; the new request replaces the old one
        transport.queue_events(vec![StreamEvent::NeedsData {
            message: "E a data?".to_string(),
            data_request: serde_json::from_value(json!({
                "fields": [{"name": "data", "label": "Data", "type": "date", "required": true}]
            }))
            .unwrap(),
        }]);

        let mut values = FieldValues::new();
        values.insert("valor".to_string(), json!("50"));
        engine.submit_data(values).await.unwrap();
        assert_eq!(engine.state().name(), "loading");
        engine.settle().await;

        let requests = transport.recorded_requests();
        assert_eq!(requests.len(), 2);
        let body = &requests[1].messages[0].content;
        assert!(body.starts_with(SUBMISSION_PREFIX));
        assert!(body.contains("valor"));

        match engine.state() {
            ConvState::AwaitingData { request } => assert_eq!(request.fields[0].name, "data"),
            other => panic!("Expected awaiting_data, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancel_data_acknowledges_locally() {
        let (mut engine, store, transport) = test_engine();
        open_data_request(&mut engine, &transport).await;

        engine.cancel_data().await.unwrap();
        assert_eq!(engine.state(), &ConvState::Idle);
        let last = engine.messages().last().unwrap();
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.content, DATA_CANCELLED_MESSAGE);
        assert_eq!(transport.recorded_requests().len(), 1);

        let stored = store.get_all_messages(&engine.session().unwrap().id);
        assert_eq!(stored.last().unwrap().content, DATA_CANCELLED_MESSAGE);
    }

    #[tokio::test]
    async fn test_busy_rejects_second_message() {
        let (mut engine, _, transport) = test_engine();
        let tx = transport.queue_channel();

        engine.send_message("primeira").await.unwrap();
        let result = engine.send_message("segunda").await;
        assert!(matches!(
            result,
            Err(EngineError::Rejected(TransitionError::AgentBusy))
        ));
        assert_eq!(engine.messages().len(), 1);

        tx.send(Ok(StreamEvent::done())).unwrap();
        engine.settle().await;
        assert_eq!(engine.state(), &ConvState::Idle);
        assert_eq!(transport.recorded_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_stream_without_terminal_is_network_error() {
        let (mut engine, _, transport) = test_engine();
        transport.queue_events(vec![StreamEvent::token("meia resposta")]);

        engine.send_message("Oi").await.unwrap();
        engine.settle().await;

        match engine.state() {
            ConvState::Error { error_kind, .. } => assert_eq!(*error_kind, ErrorKind::Network),
            other => panic!("Expected error, got {other:?}"),
        }
        assert_eq!(engine.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_agent_error_discards_partial_reply() {
        let (mut engine, _, transport) = test_engine();
        transport.queue_results(vec![
            Ok(StreamEvent::token("parcial")),
            Ok(StreamEvent::error("Serviço indisponível")),
        ]);

        engine.send_message("Oi").await.unwrap();
        engine.settle().await;

        assert_eq!(
            engine.state(),
            &ConvState::Error {
                message: "Serviço indisponível".to_string(),
                error_kind: ErrorKind::Agent,
            }
        );
        assert_eq!(engine.snapshot().error.as_deref(), Some("Serviço indisponível"));
        assert_eq!(engine.messages().len(), 1);
    }

    #[tokio::test]
    async fn test_choose_option_answers_once() {
        let (mut engine, store, transport) = test_engine();
        transport.queue_events(vec![StreamEvent::Done {
            session_id: None,
            interactive: vec![category_buttons()],
        }]);
        engine.send_message("Nova transação").await.unwrap();
        engine.settle().await;

        let question = engine.messages()[1].clone();
        assert!(question.content.is_empty());
        assert_eq!(question.interactive.len(), 1);

        transport.queue_events(vec![StreamEvent::done()]);
        engine.choose_option(&question.id, 0, "despesa").await.unwrap();
        engine.settle().await;

        assert_eq!(engine.messages()[2].role, Role::User);
        assert_eq!(engine.messages()[2].content, "Despesa");
        match &engine.messages()[1].interactive[0] {
            InteractiveElement::Buttons(buttons) => {
                assert_eq!(buttons.selected.as_deref(), Some("despesa"));
            }
            other => panic!("Expected buttons, got {other:?}"),
        }
        let stored = store.get_all_messages(&engine.session().unwrap().id);
        assert_eq!(stored[1].interactive, engine.messages()[1].interactive);

        let again = engine.choose_option(&question.id, 0, "receita").await;
        assert!(matches!(
            again,
            Err(EngineError::Protocol(ProtocolError::AlreadyAnswered(_)))
        ));
        let missing = engine.choose_option(&question.id, 3, "despesa").await;
        assert!(matches!(
            missing,
            Err(EngineError::Protocol(ProtocolError::NoSuchElement(3)))
        ));
        assert_eq!(transport.recorded_requests().len(), 2);
    }

    #[tokio::test]
    async fn test_resume_last_session_once() {
        let (mut engine, store, _) = test_engine();
        let session = store.create_session(Some("Ontem")).await.unwrap();
        store
            .append_message(&session.id, "m-1", &NewMessage::text(Role::User, "saldo"))
            .await
            .unwrap();

        assert!(engine.resume_last_session().await);
        assert_eq!(engine.session().unwrap().id, session.id);
        assert_eq!(engine.messages().len(), 1);

        engine.start_new_session();
        assert!(!engine.resume_last_session().await);
        assert!(engine.session().is_none());
    }

    #[tokio::test]
    async fn test_resume_swallows_store_failure() {
        let mut engine = ConversationEngine::new(FailingStorage, MockTransport::new());
        assert!(!engine.resume_last_session().await);
        assert_eq!(engine.state(), &ConvState::Idle);
        assert!(engine.messages().is_empty());
    }

    #[tokio::test]
    async fn test_session_creation_failure_is_persistence_error() {
        let transport = Arc::new(MockTransport::new());
        let mut engine = ConversationEngine::new(FailingStorage, transport.clone());

        let result = engine.send_message("Oi").await;
        assert!(matches!(result, Err(EngineError::Store(_))));
        match engine.state() {
            ConvState::Error { error_kind, .. } => assert_eq!(*error_kind, ErrorKind::Persistence),
            other => panic!("Expected error, got {other:?}"),
        }
        assert!(transport.recorded_requests().is_empty());

        // The user's text stays on screen
        assert_eq!(engine.messages().len(), 1);
        assert_eq!(engine.messages()[0].role, Role::User);
        assert_eq!(engine.messages()[0].content, "Oi");
    }

    #[tokio::test]
    async fn test_first_message_saved_in_new_session() {
        let (mut engine, store, transport) = test_engine();
        transport.queue_events(vec![StreamEvent::token("Uns R$ 300"), StreamEvent::done()]);

        engine.send_message("Quanto gastei?").await.unwrap();
        engine.settle().await;

        let session_id = engine.session().unwrap().id.clone();
        let stored = store.get_all_messages(&session_id);
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].role, Role::User);
        assert_eq!(stored[0].content, "Quanto gastei?");
        assert_eq!(stored[0].id, engine.messages()[0].id);
        assert_eq!(stored[1].content, "Uns R$ 300");
    }

    #[tokio::test]
    async fn test_add_message_store_failure_shows_nothing() {
        let mut engine = ConversationEngine::new(FailingStorage, MockTransport::new());
        let mut updates = engine.subscribe();

        let result = engine.add_message(NewMessage::text(Role::User, "Olá")).await;
        assert!(matches!(result, Err(EngineError::Store(_))));
        assert!(engine.messages().is_empty());
        assert!(!matches!(updates.try_recv(), Ok(EngineUpdate::Message { .. })));
    }

    #[tokio::test]
    async fn test_add_message_to_vanished_session_is_not_shown() {
        let (mut engine, store, _) = test_engine();
        engine
            .add_message(NewMessage::text(Role::User, "primeira"))
            .await
            .unwrap();
        let session_id = engine.session().unwrap().id.clone();
        store.delete_session(&session_id).await.unwrap();

        let result = engine
            .add_message(NewMessage::text(Role::Assistant, "segunda"))
            .await;
        assert!(matches!(result, Err(EngineError::SessionNotFound(id)) if id == session_id));
        assert_eq!(engine.messages().len(), 1);
        assert_eq!(engine.messages()[0].content, "primeira");
    }

    #[tokio::test]
    async fn test_blank_message_previews_its_elements() {
        let storage = InMemoryStorage::new();
        let session = storage.create_session(None).await.unwrap();
        let mut message = NewMessage::text(Role::Assistant, "");
        message.interactive = vec![category_buttons()];
        storage
            .append_message(&session.id, "m-1", &message)
            .await
            .unwrap();

        let session = storage.get_session(&session.id).await.unwrap();
        let preview = session.last_message_preview.unwrap();
        assert!(preview.contains("Que tipo de transação?"), "Got {preview}");
    }

    #[tokio::test]
    async fn test_rename_and_delete_active_session() {
        let (mut engine, store, _) = test_engine();
        engine
            .add_message(NewMessage::text(Role::User, "orçamento"))
            .await
            .unwrap();
        let session_id = engine.session().unwrap().id.clone();

        engine.rename_session(&session_id, "Orçamento de maio").await.unwrap();
        assert_eq!(engine.session().unwrap().title, "Orçamento de maio");

        engine.delete_session(&session_id).await.unwrap();
        assert!(engine.session().is_none());
        assert!(engine.messages().is_empty());
        assert_eq!(store.session_count(), 0);

        assert!(matches!(
            engine.delete_session(&session_id).await,
            Err(EngineError::SessionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_handle_drives_engine() {
        let (engine, store, transport) = test_engine();
        transport.queue_events(vec![StreamEvent::token("Olá!"), StreamEvent::done()]);

        let handle = EngineHandle::spawn(engine);
        let mut updates = handle.subscribe();
        handle.send_message("Oi".to_string()).await.unwrap();

        assert!(wait_for_turn(&mut updates, Duration::from_secs(2)).await);

        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot.state, ConvState::Idle);
        assert!(!snapshot.is_loading);
        assert_eq!(snapshot.messages.len(), 2);
        assert_eq!(snapshot.messages[1].content, "Olá!");
        assert_eq!(store.session_count(), 1);

        let result = handle.confirm().await;
        assert!(matches!(
            result,
            Err(EngineError::Rejected(TransitionError::NoPendingAction))
        ));
    }
}
