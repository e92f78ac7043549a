//! The sequential pipeline behind one streaming turn.

use super::framer::FrameSink;
use super::transaction::TurnTransaction;
use super::{TurnError, TurnSummary};
use crate::models::{ChatMessage, ChatSession};
use crate::services::metrics::{self, OUTCOME_COMPLETED};
use crate::services::providers::{
    ChatProvider, Credentials, PromptMessage, ProviderRequest, ProviderTurn,
};
use futures::StreamExt;
use service_core::chat::{Frame, Role, TurnMetadata, STREAM_INTERRUPTED};
use std::sync::Arc;
use std::time::Instant;

pub struct TurnPipeline {
    provider: Arc<dyn ChatProvider>,
    transaction: TurnTransaction,
    prompt: String,
    credentials: Credentials,
    started_at: Instant,
}

impl TurnPipeline {
    pub fn new(
        provider: Arc<dyn ChatProvider>,
        transaction: TurnTransaction,
        prompt: String,
        credentials: Credentials,
        started_at: Instant,
    ) -> Self {
        Self {
            provider,
            transaction,
            prompt,
            credentials,
            started_at,
        }
    }

    /// Drive the turn to its terminal frame.
    ///
    /// On failure the `error` frame is sent, the transaction is rolled back
    /// and the cause is returned.
    pub async fn run(mut self, sink: FrameSink) -> Result<TurnSummary, TurnError> {
        let key_class = self.credentials.class();
        let result = self.stream(&sink).await;
        let elapsed = self.started_at.elapsed().as_secs_f64();

        match result {
            Ok(summary) => {
                metrics::record_turn(OUTCOME_COMPLETED, key_class.as_str(), elapsed);
                Ok(summary)
            }
            Err(err) => {
                if sink
                    .emit(Frame::Error(STREAM_INTERRUPTED.to_string()))
                    .await
                    .is_err()
                {
                    tracing::debug!("Client gone before error frame");
                }

                if let Err(rollback_err) = self.transaction.rollback().await {
                    tracing::error!(
                        session_id = %self.transaction.session().id,
                        error = %rollback_err,
                        "Failed to roll back chat turn"
                    );
                }

                metrics::record_turn(err.outcome(), key_class.as_str(), elapsed);
                Err(err)
            }
        }
    }

    async fn stream(&mut self, sink: &FrameSink) -> Result<TurnSummary, TurnError> {
        let session_id = self.transaction.session().id_hex();
        sink.emit(Frame::Conversation(session_id.clone())).await?;

        let request = ProviderRequest {
            conversation_id: session_id.clone(),
            messages: prompt_history(self.transaction.session(), &self.prompt),
        };

        let ProviderTurn {
            mut tokens,
            usage,
            sources,
        } = self
            .provider
            .stream_chat(request, self.credentials.key())
            .await?;

        let mut answer = String::new();
        let mut chunk_count = 0usize;

        loop {
            tokio::select! {
                _ = sink.closed() => return Err(TurnError::ClientDisconnected),
                next = tokens.next() => match next {
                    Some(Ok(chunk)) => {
                        answer.push_str(&chunk);
                        chunk_count += 1;
                        sink.emit(Frame::Delta(chunk)).await?;
                    }
                    Some(Err(err)) => return Err(err.into()),
                    None => break,
                },
            }
        }
        drop(tokens);

        let (usage, sources) = tokio::join!(usage, sources);
        let usage = usage.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Usage unavailable for chat turn");
            None
        });
        let sources = sources.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Sources unavailable for chat turn");
            Vec::new()
        });

        let duration_ms = self.started_at.elapsed().as_millis() as u64;
        let key_class = self.credentials.class();
        let metadata = TurnMetadata {
            usage: usage.clone(),
            duration_ms: Some(duration_ms),
            source_count: Some(sources.len() as u32),
            sources: Some(sources.clone()),
            api_key_type: Some(key_class),
        };
        sink.emit(Frame::Metadata(metadata.clone())).await?;

        // A client that left never sees `done`, so the turn must not persist.
        // Best effort: a disconnect after this check still commits.
        if sink.is_closed() {
            return Err(TurnError::ClientDisconnected);
        }

        let assistant = ChatMessage::assistant(answer, usage.clone(), duration_ms, sources, key_class);
        self.transaction.commit(&self.prompt, assistant).await?;

        if let Some(usage) = &usage {
            metrics::record_tokens(usage);
        }

        if sink.emit(Frame::Done).await.is_err() {
            tracing::debug!(session_id = %session_id, "Client gone before done frame");
        }

        Ok(TurnSummary {
            session_id,
            created: self.transaction.created(),
            chunk_count,
            metadata,
        })
    }
}

/// Prior messages of the session, role and content only, then the new prompt.
fn prompt_history(session: &ChatSession, prompt: &str) -> Vec<PromptMessage> {
    session
        .messages
        .iter()
        .map(|message| PromptMessage {
            role: message.role,
            content: message.content.clone(),
        })
        .chain(std::iter::once(PromptMessage {
            role: Role::User,
            content: prompt.to_string(),
        }))
        .collect()
}
