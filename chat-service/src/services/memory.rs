//! In-process session store for local runs and tests.

use super::store::{SessionStore, StoreError};
use crate::models::{ChatMessage, ChatSession};
use async_trait::async_trait;
use chrono::Utc;
use mongodb::bson::oid::ObjectId;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct InMemorySessionStore {
    sessions: RwLock<HashMap<ObjectId, ChatSession>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions across all users.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn create(&self, user_id: &str, title: &str) -> Result<ChatSession, StoreError> {
        let session = ChatSession::new(user_id, title);
        self.sessions
            .write()
            .await
            .insert(session.id, session.clone());
        Ok(session)
    }

    async fn find(&self, id: &ObjectId, user_id: &str) -> Result<Option<ChatSession>, StoreError> {
        Ok(self
            .sessions
            .read()
            .await
            .get(id)
            .filter(|session| session.user_id == user_id)
            .cloned())
    }

    async fn append_turn(
        &self,
        id: &ObjectId,
        user_id: &str,
        messages: &[ChatMessage],
        title: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut sessions = self.sessions.write().await;
        let Some(session) = sessions
            .get_mut(id)
            .filter(|session| session.user_id == user_id)
        else {
            return Ok(false);
        };

        session.messages.extend_from_slice(messages);
        if let Some(title) = title {
            session.title = Some(title.to_string());
        }
        session.updated_at = Utc::now();
        Ok(true)
    }

    async fn list(&self, user_id: &str) -> Result<Vec<ChatSession>, StoreError> {
        let mut sessions: Vec<ChatSession> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|session| session.user_id == user_id)
            .cloned()
            .collect();

        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then(b.id.cmp(&a.id)));
        Ok(sessions)
    }

    async fn rename(
        &self,
        id: &ObjectId,
        user_id: &str,
        title: &str,
    ) -> Result<Option<ChatSession>, StoreError> {
        let mut sessions = self.sessions.write().await;
        Ok(sessions
            .get_mut(id)
            .filter(|session| session.user_id == user_id)
            .map(|session| {
                session.title = Some(title.to_string());
                session.updated_at = Utc::now();
                session.clone()
            }))
    }

    async fn delete(&self, id: &ObjectId, user_id: &str) -> Result<bool, StoreError> {
        let mut sessions = self.sessions.write().await;
        if sessions.get(id).is_some_and(|session| session.user_id == user_id) {
            sessions.remove(id);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
