//! HTTP request handlers

use super::sse::sse_stream;
use super::types::{
    AcceptedResponse, ChatRequest, ChooseOptionRequest, CreateSessionRequest, ErrorResponse,
    MessageResponse, RenameRequest, SessionListResponse, SessionResponse,
    SessionWithMessagesResponse, SubmitDataRequest, SuccessResponse,
};
use super::AppState;
use crate::db::{NewMessage, SessionFilter, StoreError};
use crate::runtime::{EngineError, EngineSnapshot, SessionStore};
use crate::state_machine::TransitionError;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

/// Create the API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Active conversation
        .route("/api/chat", get(get_chat))
        .route("/api/chat/stream", get(stream_chat))
        .route("/api/chat/messages", post(send_message))
        .route("/api/chat/messages/append", post(append_message))
        .route("/api/chat/messages/:id/choose", post(choose_option))
        // Gates
        .route("/api/chat/confirm", post(confirm_action))
        .route("/api/chat/reject", post(reject_action))
        .route("/api/chat/data", post(submit_data))
        .route("/api/chat/data/cancel", post(cancel_data))
        .route("/api/chat/clear-error", post(clear_error))
        // Session switching
        .route("/api/chat/new", post(new_chat))
        .route("/api/chat/load/:id", post(load_session))
        // Session history
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route("/api/sessions/:id", get(get_session).delete(delete_session))
        .route("/api/sessions/:id/rename", post(rename_session))
        // Version
        .route("/version", get(get_version))
        .with_state(state)
}

// ============================================================
// Active Conversation
// ============================================================

async fn get_chat(State(state): State<AppState>) -> Result<Json<EngineSnapshot>, AppError> {
    Ok(Json(state.engine.snapshot().await?))
}

async fn stream_chat(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    // Subscribe before taking the snapshot so nothing falls between them
    let broadcast_rx = state.engine.subscribe();
    let snapshot = state.engine.snapshot().await?;
    Ok(sse_stream(snapshot, broadcast_rx))
}

async fn send_message(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<AcceptedResponse>, AppError> {
    state.engine.send_message(req.text).await?;
    Ok(Json(AcceptedResponse::ok()))
}

async fn append_message(
    State(state): State<AppState>,
    Json(message): Json<NewMessage>,
) -> Result<Json<MessageResponse>, AppError> {
    let message = state.engine.add_message(message).await?;
    Ok(Json(MessageResponse { message }))
}

async fn choose_option(
    State(state): State<AppState>,
    Path(message_id): Path<String>,
    Json(req): Json<ChooseOptionRequest>,
) -> Result<Json<AcceptedResponse>, AppError> {
    state
        .engine
        .choose_option(message_id, req.element_index, req.value)
        .await?;
    Ok(Json(AcceptedResponse::ok()))
}

// ============================================================
// Gates
// ============================================================

async fn confirm_action(State(state): State<AppState>) -> Result<Json<AcceptedResponse>, AppError> {
    state.engine.confirm().await?;
    Ok(Json(AcceptedResponse::ok()))
}

async fn reject_action(State(state): State<AppState>) -> Result<Json<AcceptedResponse>, AppError> {
    state.engine.reject().await?;
    Ok(Json(AcceptedResponse::ok()))
}

async fn submit_data(
    State(state): State<AppState>,
    Json(req): Json<SubmitDataRequest>,
) -> Result<Json<AcceptedResponse>, AppError> {
    state.engine.submit_data(req.values).await?;
    Ok(Json(AcceptedResponse::ok()))
}

async fn cancel_data(State(state): State<AppState>) -> Result<Json<SuccessResponse>, AppError> {
    state.engine.cancel_data().await?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn clear_error(State(state): State<AppState>) -> Result<Json<SuccessResponse>, AppError> {
    state.engine.clear_error().await?;
    Ok(Json(SuccessResponse { success: true }))
}

// ============================================================
// Session Switching
// ============================================================

async fn new_chat(State(state): State<AppState>) -> Result<Json<EngineSnapshot>, AppError> {
    state.engine.new_session().await?;
    Ok(Json(state.engine.snapshot().await?))
}

async fn load_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<EngineSnapshot>, AppError> {
    state.engine.load_session(id).await?;
    Ok(Json(state.engine.snapshot().await?))
}

// ============================================================
// Session History
// ============================================================

async fn list_sessions(
    State(state): State<AppState>,
    Query(filter): Query<SessionFilter>,
) -> Result<Json<SessionListResponse>, AppError> {
    let sessions = state.store.list_sessions(&filter).await?;
    Ok(Json(SessionListResponse { sessions }))
}

async fn create_session(
    State(state): State<AppState>,
    req: Option<Json<CreateSessionRequest>>,
) -> Result<Json<SessionResponse>, AppError> {
    let req = req.map(|Json(r)| r).unwrap_or_default();
    let title = req.title.as_deref().map(str::trim).filter(|t| !t.is_empty());
    let session = state.store.create_session(title).await?;
    Ok(Json(SessionResponse { session }))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionWithMessagesResponse>, AppError> {
    let session = state.store.get_session(&id).await?;
    let messages = state.store.get_messages(&id).await?;
    Ok(Json(SessionWithMessagesResponse { session, messages }))
}

async fn rename_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RenameRequest>,
) -> Result<Json<SessionResponse>, AppError> {
    state.engine.rename_session(id.clone(), req.title).await?;
    let session = state.store.get_session(&id).await?;
    Ok(Json(SessionResponse { session }))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, AppError> {
    state.engine.delete_session(id).await?;
    Ok(Json(SuccessResponse { success: true }))
}

async fn get_version() -> &'static str {
    concat!("fincopilot ", env!("CARGO_PKG_VERSION"))
}

// ============================================================
// Error Handling
// ============================================================

#[derive(Debug)]
enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unprocessable(ErrorResponse),
    Internal(String),
}

impl From<EngineError> for AppError {
    fn from(e: EngineError) -> Self {
        let message = e.to_string();
        match e {
            EngineError::Rejected(TransitionError::Validation(fields)) => {
                AppError::Unprocessable(ErrorResponse::with_fields(message, fields))
            }
            EngineError::Rejected(TransitionError::EmptyMessage) | EngineError::Protocol(_) => {
                AppError::BadRequest(message)
            }
            EngineError::Rejected(_) => AppError::Conflict(message),
            EngineError::SessionNotFound(_) | EngineError::MessageNotFound(_) => {
                AppError::NotFound(message)
            }
            EngineError::Store(e) => e.into(),
            EngineError::EngineStopped => AppError::Internal(message),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        let message = e.to_string();
        match e {
            e if e.is_not_found() => AppError::NotFound(message),
            StoreError::InvalidTitle | StoreError::TransientRole(_) => {
                AppError::BadRequest(message)
            }
            _ => {
                tracing::error!(error = %message, "Storage failure");
                AppError::Internal(message)
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, ErrorResponse::new(msg)),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, ErrorResponse::new(msg)),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, ErrorResponse::new(msg)),
            AppError::Unprocessable(body) => (StatusCode::UNPROCESSABLE_ENTITY, body),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, ErrorResponse::new(msg)),
        };

        (status, Json(body)).into_response()
    }
}
