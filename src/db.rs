//! Session store backed by `SQLite`
//!
//! Provides persistence for chat sessions and their messages.

mod schema;

pub use schema::*;

use crate::protocol::{parse_elements, InteractiveContent};
use crate::title::session_preview;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Message not found: {0}")]
    MessageNotFound(String),
    #[error("Messages with role '{0}' are not persisted")]
    TransientRole(Role),
    #[error("Session title cannot be empty")]
    InvalidTitle,
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::SessionNotFound(_) | StoreError::MessageNotFound(_)
        )
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Self::init(Connection::open(path)?)
    }

    /// Open an in-memory database (for testing)
    #[allow(dead_code)] // Used in tests
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ==================== Session Operations ====================

    /// Create a new, empty session
    pub fn create_session(&self, title: &str) -> StoreResult<Session> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let id = uuid::Uuid::new_v4().to_string();

        conn.execute(
            "INSERT INTO sessions (id, title, last_message_preview, created_at, updated_at)
             VALUES (?1, ?2, NULL, ?3, ?3)",
            params![id, title, format_datetime(now)],
        )?;

        Ok(Session {
            id,
            title: title.to_string(),
            last_message_preview: None,
            created_at: now,
            updated_at: now,
        })
    }

    /// Get session by ID
    pub fn get_session(&self, id: &str) -> StoreResult<Session> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, title, last_message_preview, created_at, updated_at
             FROM sessions WHERE id = ?1",
            params![id],
            parse_session_row,
        )
        .map_err(|e| match e {
            rusqlite::Error::QueryReturnedNoRows => StoreError::SessionNotFound(id.to_string()),
            other => StoreError::Sqlite(other),
        })
    }

    /// List sessions, most recently updated first
    pub fn list_sessions(&self, filter: &SessionFilter) -> StoreResult<Vec<Session>> {
        let mut sql = String::from(
            "SELECT id, title, last_message_preview, created_at, updated_at
             FROM sessions WHERE 1 = 1",
        );
        let mut args: Vec<SqlValue> = Vec::new();

        if let Some(search) = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            sql.push_str(
                " AND (lower(title) LIKE ? ESCAPE '\\'
                  OR lower(COALESCE(last_message_preview, '')) LIKE ? ESCAPE '\\')",
            );
            let pattern = format!("%{}%", escape_like(&search.to_lowercase()));
            args.push(SqlValue::Text(pattern.clone()));
            args.push(SqlValue::Text(pattern));
        }
        if let Some(from) = filter.date_from {
            sql.push_str(" AND substr(updated_at, 1, 10) >= ?");
            args.push(SqlValue::Text(from.format("%Y-%m-%d").to_string()));
        }
        if let Some(to) = filter.date_to {
            sql.push_str(" AND substr(updated_at, 1, 10) <= ?");
            args.push(SqlValue::Text(to.format("%Y-%m-%d").to_string()));
        }
        sql.push_str(" ORDER BY updated_at DESC, rowid DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            args.push(SqlValue::Integer(i64::from(limit)));
        }

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args), parse_session_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    /// Change a session's display title
    pub fn rename_session(&self, id: &str, title: &str) -> StoreResult<()> {
        let title = title.trim();
        if title.is_empty() {
            return Err(StoreError::InvalidTitle);
        }
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE sessions SET title = ?1 WHERE id = ?2",
            params![title, id],
        )?;
        if updated == 0 {
            return Err(StoreError::SessionNotFound(id.to_string()));
        }
        Ok(())
    }

    /// Delete a session and, by cascade, its messages
    pub fn delete_session(&self, id: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(StoreError::SessionNotFound(id.to_string()));
        }
        Ok(())
    }

    // ==================== Message Operations ====================

    /// Append a message to a session.
    ///
    /// The `message_id` is generated by the caller so the in-memory copy and
    /// the stored row share it. Also refreshes the session's preview and
    /// `updated_at`; a message with no prose previews as the text rendering
    /// of its elements.
    pub fn add_message(
        &self,
        message_id: &str,
        session_id: &str,
        message: &NewMessage,
    ) -> StoreResult<ChatMessage> {
        if !message.role.is_persisted() {
            return Err(StoreError::TransientRole(message.role));
        }

        let conn = self.conn.lock().unwrap();
        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }

        let saved = message.clone().into_message(message_id);
        let now = format_datetime(saved.created_at);

        let sequence_id: i64 = conn.query_row(
            "SELECT COALESCE(MAX(sequence_id), 0) + 1 FROM messages WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;

        let tool_calls = saved
            .tool_calls
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let interactive = if saved.interactive.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&saved.interactive)?)
        };

        conn.execute(
            "INSERT INTO messages
             (id, session_id, sequence_id, role, content, tool_calls, interactive, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                saved.id,
                session_id,
                sequence_id,
                saved.role.as_str(),
                saved.content,
                tool_calls,
                interactive,
                now,
            ],
        )?;

        let preview = session_preview(&saved.content, &saved.interactive);
        conn.execute(
            "UPDATE sessions
             SET updated_at = ?1, last_message_preview = COALESCE(?2, last_message_preview)
             WHERE id = ?3",
            params![now, preview, session_id],
        )?;

        Ok(saved)
    }

    /// Messages of a session, oldest first. Fails for unknown sessions.
    pub fn get_messages(&self, session_id: &str) -> StoreResult<Vec<ChatMessage>> {
        let conn = self.conn.lock().unwrap();
        let exists: i64 = conn.query_row(
            "SELECT COUNT(*) FROM sessions WHERE id = ?1",
            params![session_id],
            |row| row.get(0),
        )?;
        if exists == 0 {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }

        let mut stmt = conn.prepare(
            "SELECT id, role, content, tool_calls, interactive, created_at
             FROM messages WHERE session_id = ?1 ORDER BY sequence_id ASC",
        )?;
        let rows = stmt.query_map(params![session_id], parse_message_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(StoreError::from)
    }

    /// Replace the interactive content of a stored message (button answers)
    pub fn update_interactive(
        &self,
        message_id: &str,
        interactive: &InteractiveContent,
    ) -> StoreResult<()> {
        let json = serde_json::to_string(interactive)?;
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            "UPDATE messages SET interactive = ?1 WHERE id = ?2",
            params![json, message_id],
        )?;
        if updated == 0 {
            return Err(StoreError::MessageNotFound(message_id.to_string()));
        }
        Ok(())
    }
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn parse_session_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        title: row.get(1)?,
        last_message_preview: row.get(2)?,
        created_at: parse_datetime(&row.get::<_, String>(3)?),
        updated_at: parse_datetime(&row.get::<_, String>(4)?),
    })
}

/// Parse a message row from the database
fn parse_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    let role_str: String = row.get(1)?;
    let role = role_str.parse().unwrap_or(Role::System);

    let interactive = row
        .get::<_, Option<String>>(4)?
        .and_then(|s| serde_json::from_str::<Vec<serde_json::Value>>(&s).ok())
        .map(parse_elements)
        .unwrap_or_default();

    Ok(ChatMessage {
        id: row.get(0)?,
        role,
        content: row.get(2)?,
        tool_calls: row
            .get::<_, Option<String>>(3)?
            .and_then(|s| serde_json::from_str(&s).ok()),
        interactive,
        created_at: parse_datetime(&row.get::<_, String>(5)?),
    })
}

fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
