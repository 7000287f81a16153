//! Fincopilot - conversational personal-finance assistant
//!
//! A Rust backend orchestrating chat with a streaming finance agent: the
//! conversation state machine, confirmation and data-collection gates,
//! and session persistence.

mod api;
mod config;
mod db;
mod gate;
mod protocol;
mod runtime;
mod state_machine;
mod title;
mod transport;

use api::{create_router, AppState};
use config::AppConfig;
use db::Database;
use runtime::{ConversationEngine, DatabaseStorage, EngineHandle, ProductionEngine};
use std::net::SocketAddr;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::HttpTransport;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fincopilot=info,tower_http=debug".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = AppConfig::from_env();

    // Ensure database directory exists
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(path = %config.db_path.display(), "Opening database");
    let store = DatabaseStorage::new(Database::open(&config.db_path)?);

    let transport = HttpTransport::new(
        config.agent_url.clone(),
        config.agent_key.clone(),
        config.agent_timeout,
    )?;
    if transport.is_configured() {
        tracing::info!(url = ?config.agent_url, "Agent endpoint configured");
    } else {
        tracing::warn!("No agent endpoint configured. Set FINCOPILOT_AGENT_URL.");
    }

    let engine: ProductionEngine = ConversationEngine::new(store.clone(), transport);
    let state = AppState::new(EngineHandle::spawn(engine), store);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("Fincopilot server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down");
        })
        .await?;

    Ok(())
}
