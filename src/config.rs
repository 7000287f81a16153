//! Process configuration from environment variables

use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_PORT: u16 = 8000;
const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 120;

/// Configuration for the server process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub db_path: PathBuf,
    pub port: u16,
    /// Streaming endpoint of the agent; turns fail without it
    pub agent_url: Option<String>,
    pub agent_key: Option<String>,
    /// Longest silence tolerated while reading a turn's stream
    pub agent_timeout: Duration,
}

impl AppConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let db_path = var("FINCOPILOT_DB_PATH").map_or_else(
            || {
                let home = var("HOME").unwrap_or_else(|| "/tmp".to_string());
                PathBuf::from(format!("{home}/.fincopilot/fincopilot.db"))
            },
            PathBuf::from,
        );

        let port = var("FINCOPILOT_PORT")
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_PORT);

        let agent_timeout = var("FINCOPILOT_AGENT_TIMEOUT_SECS")
            .and_then(|s| s.parse().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_AGENT_TIMEOUT_SECS);

        Self {
            db_path,
            port,
            agent_url: var("FINCOPILOT_AGENT_URL").filter(|s| !s.trim().is_empty()),
            agent_key: var("FINCOPILOT_AGENT_KEY").filter(|s| !s.trim().is_empty()),
            agent_timeout: Duration::from_secs(agent_timeout),
        }
    }
}
