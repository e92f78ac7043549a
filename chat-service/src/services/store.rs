//! Session storage abstraction.
//!
//! Every operation is scoped to the owning user: a session owned by someone
//! else behaves exactly like a missing one.

use crate::models::{ChatMessage, ChatSession};
use async_trait::async_trait;
use mongodb::bson::oid::ObjectId;
use service_core::error::AppError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid chat id: {0}")]
    InvalidId(String),

    #[error("Database error: {0}")]
    Database(#[from] mongodb::error::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] mongodb::bson::ser::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::InvalidId(_) => AppError::bad_request("Invalid chat id"),
            other => AppError::DatabaseError(anyhow::Error::new(other)),
        }
    }
}

/// Parse a client-supplied session id.
pub fn parse_session_id(raw: &str) -> Result<ObjectId, StoreError> {
    ObjectId::parse_str(raw.trim()).map_err(|_| StoreError::InvalidId(raw.to_string()))
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Insert an empty session owned by `user_id`.
    async fn create(&self, user_id: &str, title: &str) -> Result<ChatSession, StoreError>;

    async fn find(&self, id: &ObjectId, user_id: &str) -> Result<Option<ChatSession>, StoreError>;

    /// Append `messages` and optionally replace the title in one atomic
    /// update. Returns `false` if the session no longer exists.
    async fn append_turn(
        &self,
        id: &ObjectId,
        user_id: &str,
        messages: &[ChatMessage],
        title: Option<&str>,
    ) -> Result<bool, StoreError>;

    /// All sessions of `user_id`, most recently updated first.
    async fn list(&self, user_id: &str) -> Result<Vec<ChatSession>, StoreError>;

    async fn rename(
        &self,
        id: &ObjectId,
        user_id: &str,
        title: &str,
    ) -> Result<Option<ChatSession>, StoreError>;

    async fn delete(&self, id: &ObjectId, user_id: &str) -> Result<bool, StoreError>;

    async fn health_check(&self) -> Result<(), StoreError>;
}
