//! Persistence seam used by the send orchestrator
//!
//! The orchestrator talks to `MessageStore`; `DatabaseStore` adapts the
//! SQLite `Database` to it.

use crate::conversation::Role;
use crate::db::{ChatRecord, Database, DbError, MessageRecord};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    /// Worth retrying later, e.g. by the reconciliation pass
    #[error("Store unavailable: {0}")]
    Transient(String),
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::ChatNotFound(id) => StoreError::NotFound(id),
            DbError::Forbidden(id) => StoreError::Forbidden(id),
            other => StoreError::Transient(other.to_string()),
        }
    }
}

/// Chat and message persistence scoped to a user
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_chat(&self, user_id: &str, title: &str) -> Result<ChatRecord, StoreError>;

    async fn get_chat(&self, chat_id: &str, user_id: &str) -> Result<ChatRecord, StoreError>;

    async fn list_chats(&self, user_id: &str) -> Result<Vec<ChatRecord>, StoreError>;

    async fn update_chat_title(
        &self,
        chat_id: &str,
        user_id: &str,
        title: &str,
    ) -> Result<(), StoreError>;

    async fn set_chat_pinned(
        &self,
        chat_id: &str,
        user_id: &str,
        pinned: bool,
    ) -> Result<(), StoreError>;

    async fn delete_chat(&self, chat_id: &str, user_id: &str) -> Result<(), StoreError>;

    /// Remove every chat of the user; returns how many were deleted
    async fn delete_all_chats(&self, user_id: &str) -> Result<usize, StoreError>;

    /// Save a message; an id that is already stored is a no-op
    async fn create_message(
        &self,
        chat_id: &str,
        user_id: &str,
        role: Role,
        content: &str,
        message_id: Option<&str>,
    ) -> Result<MessageRecord, StoreError>;

    async fn list_messages(
        &self,
        chat_id: &str,
        user_id: &str,
    ) -> Result<Vec<MessageRecord>, StoreError>;
}

// ============================================================================
// Arc implementation for trait objects
// ============================================================================

#[async_trait]
impl<T: MessageStore + ?Sized> MessageStore for Arc<T> {
    async fn create_chat(&self, user_id: &str, title: &str) -> Result<ChatRecord, StoreError> {
        (**self).create_chat(user_id, title).await
    }

    async fn get_chat(&self, chat_id: &str, user_id: &str) -> Result<ChatRecord, StoreError> {
        (**self).get_chat(chat_id, user_id).await
    }

    async fn list_chats(&self, user_id: &str) -> Result<Vec<ChatRecord>, StoreError> {
        (**self).list_chats(user_id).await
    }

    async fn update_chat_title(
        &self,
        chat_id: &str,
        user_id: &str,
        title: &str,
    ) -> Result<(), StoreError> {
        (**self).update_chat_title(chat_id, user_id, title).await
    }

    async fn set_chat_pinned(
        &self,
        chat_id: &str,
        user_id: &str,
        pinned: bool,
    ) -> Result<(), StoreError> {
        (**self).set_chat_pinned(chat_id, user_id, pinned).await
    }

    async fn delete_chat(&self, chat_id: &str, user_id: &str) -> Result<(), StoreError> {
        (**self).delete_chat(chat_id, user_id).await
    }

    async fn delete_all_chats(&self, user_id: &str) -> Result<usize, StoreError> {
        (**self).delete_all_chats(user_id).await
    }

    async fn create_message(
        &self,
        chat_id: &str,
        user_id: &str,
        role: Role,
        content: &str,
        message_id: Option<&str>,
    ) -> Result<MessageRecord, StoreError> {
        (**self)
            .create_message(chat_id, user_id, role, content, message_id)
            .await
    }

    async fn list_messages(
        &self,
        chat_id: &str,
        user_id: &str,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        (**self).list_messages(chat_id, user_id).await
    }
}

// ============================================================================
// Production Adapter
// ============================================================================

/// Adapter to use `Database` as a `MessageStore`
#[derive(Clone)]
pub struct DatabaseStore {
    db: Database,
}

impl DatabaseStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl MessageStore for DatabaseStore {
    async fn create_chat(&self, user_id: &str, title: &str) -> Result<ChatRecord, StoreError> {
        Ok(self.db.create_chat(user_id, title)?)
    }

    async fn get_chat(&self, chat_id: &str, user_id: &str) -> Result<ChatRecord, StoreError> {
        Ok(self.db.get_chat(chat_id, user_id)?)
    }

    async fn list_chats(&self, user_id: &str) -> Result<Vec<ChatRecord>, StoreError> {
        Ok(self.db.list_chats(user_id)?)
    }

    async fn update_chat_title(
        &self,
        chat_id: &str,
        user_id: &str,
        title: &str,
    ) -> Result<(), StoreError> {
        Ok(self.db.update_chat_title(chat_id, user_id, title)?)
    }

    async fn set_chat_pinned(
        &self,
        chat_id: &str,
        user_id: &str,
        pinned: bool,
    ) -> Result<(), StoreError> {
        Ok(self.db.set_chat_pinned(chat_id, user_id, pinned)?)
    }

    async fn delete_chat(&self, chat_id: &str, user_id: &str) -> Result<(), StoreError> {
        Ok(self.db.delete_chat(chat_id, user_id)?)
    }

    async fn delete_all_chats(&self, user_id: &str) -> Result<usize, StoreError> {
        Ok(self.db.delete_all_chats(user_id)?)
    }

    async fn create_message(
        &self,
        chat_id: &str,
        user_id: &str,
        role: Role,
        content: &str,
        message_id: Option<&str>,
    ) -> Result<MessageRecord, StoreError> {
        Ok(self
            .db
            .add_message(chat_id, user_id, role, content, message_id)?)
    }

    async fn list_messages(
        &self,
        chat_id: &str,
        user_id: &str,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        Ok(self.db.list_messages(chat_id, user_id)?)
    }
}
