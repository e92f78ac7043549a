//! Streaming chat turns.
//!
//! [`start_turn`] validates and resolves the session synchronously, so
//! request errors still become plain HTTP statuses. Everything after that
//! runs in a spawned task that reports through frames only.

pub mod framer;
pub mod pipeline;
pub mod transaction;

use crate::models::{title_from_prompt, ChatSession, CREATE_TITLE_CHARS};
use crate::services::metrics::{OUTCOME_DISCONNECTED, OUTCOME_FAILED};
use crate::services::providers::{Credentials, ProviderError};
use crate::services::{parse_session_id, SessionStore, StoreError};
use crate::startup::AppState;
use framer::{FrameSink, FRAME_BUFFER};
use mongodb::bson::oid::ObjectId;
use pipeline::TurnPipeline;
use secrecy::Secret;
use service_core::chat::{Frame, StreamRequest, TurnMetadata};
use service_core::error::AppError;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::Instrument;
use transaction::TurnTransaction;

#[derive(Debug, Error)]
pub enum TurnError {
    #[error("Provider failure: {0}")]
    Provider(#[from] ProviderError),

    #[error("Store failure: {0}")]
    Store(#[from] StoreError),

    #[error("Session {0} disappeared before commit")]
    SessionVanished(String),

    #[error("Client disconnected")]
    ClientDisconnected,

    #[error("Turn already finished")]
    Finished,
}

impl TurnError {
    /// Metrics label for the failed turn.
    pub fn outcome(&self) -> &'static str {
        match self {
            TurnError::ClientDisconnected => OUTCOME_DISCONNECTED,
            _ => OUTCOME_FAILED,
        }
    }
}

/// A validated `POST /chat/stream` body.
#[derive(Debug)]
pub struct TurnRequest {
    pub prompt: String,
    pub conversation_id: Option<ObjectId>,
    pub api_key: Option<Secret<String>>,
}

impl TurnRequest {
    pub fn parse(body: StreamRequest) -> Result<Self, AppError> {
        let prompt = body.prompt.as_deref().map(str::trim).unwrap_or_default();
        if prompt.is_empty() {
            return Err(AppError::bad_request("Prompt is required"));
        }

        let conversation_id = match body.conversation_id.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(parse_session_id(raw)?),
        };

        let api_key = body
            .api_key
            .map(|key| key.trim().to_string())
            .filter(|key| !key.is_empty())
            .map(Secret::new);

        Ok(Self {
            prompt: prompt.to_string(),
            conversation_id,
            api_key,
        })
    }
}

/// Result of a turn that reached `done`.
#[derive(Debug, Clone)]
pub struct TurnSummary {
    pub session_id: String,
    pub created: bool,
    pub chunk_count: usize,
    pub metadata: TurnMetadata,
}

/// A running turn.
pub struct TurnHandle {
    pub session_id: String,
    pub created: bool,
    /// Frames in emission order; dropping this aborts the turn.
    pub frames: mpsc::Receiver<Frame>,
    /// Resolves with the turn outcome once the terminal frame was sent.
    pub task: JoinHandle<Result<TurnSummary, TurnError>>,
}

/// Validate, resolve the target session and spawn the turn.
pub async fn start_turn(
    state: &AppState,
    user_id: &str,
    request: TurnRequest,
) -> Result<TurnHandle, AppError> {
    let started_at = Instant::now();

    let (session, created) = resolve_session(state.store.as_ref(), user_id, &request).await?;
    let session_id = session.id_hex();
    let credentials = Credentials::resolve(request.api_key, &state.config.provider.api_key);

    let span = tracing::info_span!(
        "chat_turn",
        session_id = %session_id,
        created,
        key_class = %credentials.class(),
        provider = state.provider.name(),
    );

    let (sink, frames) = FrameSink::channel(FRAME_BUFFER);
    let pipeline = TurnPipeline::new(
        state.provider.clone(),
        TurnTransaction::begin(state.store.clone(), session, created),
        request.prompt,
        credentials,
        started_at,
    );

    let task = tokio::spawn(
        async move {
            let result = pipeline.run(sink).await;
            match &result {
                Ok(summary) => tracing::info!(
                    chunks = summary.chunk_count,
                    duration_ms = ?summary.metadata.duration_ms,
                    "Chat turn completed"
                ),
                Err(TurnError::ClientDisconnected) => {
                    tracing::info!("Chat turn abandoned by client")
                }
                Err(e) => tracing::error!(error = %e, "Chat turn failed"),
            }
            result
        }
        .instrument(span),
    );

    Ok(TurnHandle {
        session_id,
        created,
        frames,
        task,
    })
}

/// Load the caller's session, or create one when none was given or found.
async fn resolve_session(
    store: &dyn SessionStore,
    user_id: &str,
    request: &TurnRequest,
) -> Result<(ChatSession, bool), StoreError> {
    if let Some(id) = &request.conversation_id {
        if let Some(session) = store.find(id, user_id).await? {
            return Ok((session, false));
        }
        tracing::debug!(conversation_id = %id, "Conversation not found, starting a new one");
    }

    let title = title_from_prompt(&request.prompt, CREATE_TITLE_CHARS);
    let session = store.create(user_id, &title).await?;
    Ok((session, true))
}
