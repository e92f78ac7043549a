//! MongoDB-backed session store.

use super::metrics::record_store_error;
use super::store::{SessionStore, StoreError};
use crate::models::{ChatMessage, ChatSession};
use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt;
use mongodb::{
    bson::{self, doc, oid::ObjectId, Document},
    options::{FindOneAndUpdateOptions, FindOptions, IndexOptions, ReturnDocument},
    Client as MongoClient, Collection, Database, IndexModel,
};
use service_core::error::AppError;

const SESSIONS_COLLECTION: &str = "chat_sessions";

#[derive(Clone)]
pub struct MongoSessionStore {
    client: MongoClient,
    db: Database,
}

impl MongoSessionStore {
    pub async fn connect(uri: &str, database: &str) -> Result<Self, AppError> {
        tracing::info!(database = %database, "Connecting to MongoDB");
        let client = MongoClient::with_uri_str(uri).await.map_err(|e| {
            tracing::error!("Failed to connect to MongoDB: {}", e);
            AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
        })?;
        let db = client.database(database);
        tracing::info!(database = %database, "Successfully connected to MongoDB database");
        Ok(Self { client, db })
    }

    pub async fn initialize_indexes(&self) -> Result<(), AppError> {
        tracing::info!("Creating MongoDB indexes for chat-service");

        // History listing: owner, newest first
        let user_updated_index = IndexModel::builder()
            .keys(doc! { "user_id": 1, "updated_at": -1 })
            .options(
                IndexOptions::builder()
                    .name("user_updated_idx".to_string())
                    .build(),
            )
            .build();

        self.sessions()
            .create_index(user_updated_index, None)
            .await
            .map_err(|e| {
                tracing::error!("Failed to create user_updated index: {}", e);
                AppError::DatabaseError(anyhow::anyhow!(e.to_string()))
            })?;

        tracing::info!("Successfully created all MongoDB indexes");
        Ok(())
    }

    pub fn sessions(&self) -> Collection<ChatSession> {
        self.db.collection(SESSIONS_COLLECTION)
    }

    fn owned(id: &ObjectId, user_id: &str) -> Document {
        doc! { "_id": *id, "user_id": user_id }
    }
}

fn store_failure(operation: &'static str) -> impl Fn(mongodb::error::Error) -> StoreError {
    move |e| {
        tracing::error!(operation, error = %e, "Session store operation failed");
        record_store_error(operation);
        StoreError::Database(e)
    }
}

#[async_trait]
impl SessionStore for MongoSessionStore {
    async fn create(&self, user_id: &str, title: &str) -> Result<ChatSession, StoreError> {
        let session = ChatSession::new(user_id, title);
        self.sessions()
            .insert_one(&session, None)
            .await
            .map_err(store_failure("create"))?;

        tracing::debug!(session_id = %session.id, "Chat session created");
        Ok(session)
    }

    async fn find(&self, id: &ObjectId, user_id: &str) -> Result<Option<ChatSession>, StoreError> {
        self.sessions()
            .find_one(Self::owned(id, user_id), None)
            .await
            .map_err(store_failure("find"))
    }

    async fn append_turn(
        &self,
        id: &ObjectId,
        user_id: &str,
        messages: &[ChatMessage],
        title: Option<&str>,
    ) -> Result<bool, StoreError> {
        let pushed = bson::to_bson(messages)?;

        let mut set = doc! { "updated_at": Utc::now().timestamp_millis() };
        if let Some(title) = title {
            set.insert("title", title);
        }

        let result = self
            .sessions()
            .update_one(
                Self::owned(id, user_id),
                doc! {
                    "$push": { "messages": { "$each": pushed } },
                    "$set": set,
                },
                None,
            )
            .await
            .map_err(store_failure("append_turn"))?;

        Ok(result.matched_count == 1)
    }

    async fn list(&self, user_id: &str) -> Result<Vec<ChatSession>, StoreError> {
        let options = FindOptions::builder()
            .sort(doc! { "updated_at": -1, "_id": -1 })
            .build();

        let cursor = self
            .sessions()
            .find(doc! { "user_id": user_id }, options)
            .await
            .map_err(store_failure("list"))?;

        cursor.try_collect().await.map_err(store_failure("list"))
    }

    async fn rename(
        &self,
        id: &ObjectId,
        user_id: &str,
        title: &str,
    ) -> Result<Option<ChatSession>, StoreError> {
        let options = FindOneAndUpdateOptions::builder()
            .return_document(ReturnDocument::After)
            .build();

        self.sessions()
            .find_one_and_update(
                Self::owned(id, user_id),
                doc! { "$set": { "title": title, "updated_at": Utc::now().timestamp_millis() } },
                options,
            )
            .await
            .map_err(store_failure("rename"))
    }

    async fn delete(&self, id: &ObjectId, user_id: &str) -> Result<bool, StoreError> {
        let result = self
            .sessions()
            .delete_one(Self::owned(id, user_id), None)
            .await
            .map_err(store_failure("delete"))?;

        Ok(result.deleted_count == 1)
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        self.client
            .database("admin")
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(store_failure("health_check"))?;
        Ok(())
    }
}
