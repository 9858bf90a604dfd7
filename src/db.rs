//! Database module for Kacademyx
//!
//! Persists chats and their messages. Every chat belongs to one user and
//! every operation checks ownership.

mod schema;

pub use schema::*;

use crate::conversation::Role;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Chat not found: {0}")]
    ChatNotFound(String),
    #[error("Chat {0} belongs to another user")]
    Forbidden(String),
    #[error("Database lock poisoned")]
    LockPoisoned,
}

pub type DbResult<T> = Result<T, DbError>;

const CHAT_COLUMNS: &str = "id, user_id, title, pinned, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, chat_id, role, content, created_at";

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    #[cfg(test)]
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn conn(&self) -> DbResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DbError::LockPoisoned)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== Chat Operations ====================

    pub fn create_chat(&self, user_id: &str, title: &str) -> DbResult<ChatRecord> {
        let conn = self.conn()?;
        let now = Utc::now();
        let id = uuid::Uuid::new_v4().to_string();

        conn.execute(
            "INSERT INTO chats (id, user_id, title, pinned, created_at, updated_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?4)",
            params![id, user_id, title, now.to_rfc3339()],
        )?;

        Ok(ChatRecord {
            id,
            user_id: user_id.to_string(),
            title: title.to_string(),
            pinned: false,
            created_at: now,
            updated_at: now,
        })
    }

    /// Get a chat owned by `user_id`
    pub fn get_chat(&self, chat_id: &str, user_id: &str) -> DbResult<ChatRecord> {
        let conn = self.conn()?;
        owned_chat(&conn, chat_id, user_id)
    }

    /// Chats of a user, pinned first, then most recently updated
    pub fn list_chats(&self, user_id: &str) -> DbResult<Vec<ChatRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHAT_COLUMNS} FROM chats WHERE user_id = ?1
             ORDER BY pinned DESC, updated_at DESC"
        ))?;

        let rows = stmt.query_map(params![user_id], parse_chat_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }

    pub fn update_chat_title(&self, chat_id: &str, user_id: &str, title: &str) -> DbResult<()> {
        let conn = self.conn()?;
        owned_chat(&conn, chat_id, user_id)?;
        conn.execute(
            "UPDATE chats SET title = ?1, updated_at = ?2 WHERE id = ?3",
            params![title, Utc::now().to_rfc3339(), chat_id],
        )?;
        Ok(())
    }

    /// Pinned chats sort first. Pinning leaves `updated_at` alone.
    pub fn set_chat_pinned(&self, chat_id: &str, user_id: &str, pinned: bool) -> DbResult<()> {
        let conn = self.conn()?;
        owned_chat(&conn, chat_id, user_id)?;
        conn.execute(
            "UPDATE chats SET pinned = ?1 WHERE id = ?2",
            params![pinned, chat_id],
        )?;
        Ok(())
    }

    /// Delete a chat and, by cascade, its messages
    pub fn delete_chat(&self, chat_id: &str, user_id: &str) -> DbResult<()> {
        let conn = self.conn()?;
        owned_chat(&conn, chat_id, user_id)?;
        conn.execute("DELETE FROM chats WHERE id = ?1", params![chat_id])?;
        Ok(())
    }

    /// Delete every chat of a user; returns how many were removed
    pub fn delete_all_chats(&self, user_id: &str) -> DbResult<usize> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM chats WHERE user_id = ?1", params![user_id])?;
        Ok(deleted)
    }

    // ==================== Message Operations ====================

    /// Add a message to a chat.
    ///
    /// `message_id` is normally the client-side id. Saving an id that is
    /// already stored in the chat returns the stored row unchanged.
    pub fn add_message(
        &self,
        chat_id: &str,
        user_id: &str,
        role: Role,
        content: &str,
        message_id: Option<&str>,
    ) -> DbResult<MessageRecord> {
        let conn = self.conn()?;
        owned_chat(&conn, chat_id, user_id)?;

        if let Some(id) = message_id {
            let existing = conn
                .query_row(
                    &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1 AND chat_id = ?2"),
                    params![id, chat_id],
                    parse_message_row,
                )
                .optional()?;
            if let Some(existing) = existing {
                tracing::debug!(message_id = %id, "Message already stored");
                return Ok(existing);
            }
        }

        let id = message_id.map_or_else(|| uuid::Uuid::new_v4().to_string(), String::from);
        let now = Utc::now();
        let seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE chat_id = ?1",
            params![chat_id],
            |row| row.get(0),
        )?;

        conn.execute(
            "INSERT INTO messages (id, chat_id, seq, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![id, chat_id, seq, role.as_str(), content, now.to_rfc3339()],
        )?;

        // Update chat timestamp
        conn.execute(
            "UPDATE chats SET updated_at = ?1 WHERE id = ?2",
            params![now.to_rfc3339(), chat_id],
        )?;

        Ok(MessageRecord {
            id,
            chat_id: chat_id.to_string(),
            role,
            content: content.to_string(),
            created_at: now,
        })
    }

    /// Messages of a chat in insertion order
    pub fn list_messages(&self, chat_id: &str, user_id: &str) -> DbResult<Vec<MessageRecord>> {
        let conn = self.conn()?;
        owned_chat(&conn, chat_id, user_id)?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE chat_id = ?1 ORDER BY seq ASC"
        ))?;

        let rows = stmt.query_map(params![chat_id], parse_message_row)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(DbError::from)
    }
}

fn owned_chat(conn: &Connection, chat_id: &str, user_id: &str) -> DbResult<ChatRecord> {
    let chat = conn
        .query_row(
            &format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?1"),
            params![chat_id],
            parse_chat_row,
        )
        .optional()?
        .ok_or_else(|| DbError::ChatNotFound(chat_id.to_string()))?;

    if chat.user_id != user_id {
        return Err(DbError::Forbidden(chat_id.to_string()));
    }
    Ok(chat)
}

fn parse_chat_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatRecord> {
    Ok(ChatRecord {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        pinned: row.get(3)?,
        created_at: parse_datetime(&row.get::<_, String>(4)?),
        updated_at: parse_datetime(&row.get::<_, String>(5)?),
    })
}

fn parse_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    let role_str: String = row.get(2)?;
    let role = Role::parse(&role_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown role {role_str:?}").into(),
        )
    })?;

    Ok(MessageRecord {
        id: row.get(0)?,
        chat_id: row.get(1)?,
        role,
        content: row.get(3)?,
        created_at: parse_datetime(&row.get::<_, String>(4)?),
    })
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
