//! HTTP API for the chat assistant
//!
//! `/api/chat` drives the active conversation, `/api/sessions` browses and
//! manages history. Live updates stream from `/api/chat/stream`.

mod handlers;
mod sse;
mod types;

pub use handlers::create_router;

use crate::runtime::{DatabaseStorage, EngineHandle};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: EngineHandle,
    /// Read access to history without going through the engine task
    pub store: DatabaseStorage,
}

impl AppState {
    pub fn new(engine: EngineHandle, store: DatabaseStorage) -> Self {
        Self { engine, store }
    }
}
