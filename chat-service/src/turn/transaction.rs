//! All-or-nothing persistence of one turn.
//!
//! The user/assistant pair is written with a single store update on commit.
//! Rollback restores the checkpointed message count and removes the session
//! when this turn created it.

use super::TurnError;
use crate::models::{title_from_prompt, ChatMessage, ChatSession, COMMIT_TITLE_CHARS};
use crate::services::{SessionStore, StoreError};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionState {
    Open,
    Committed,
    RolledBack,
}

pub struct TurnTransaction {
    store: Arc<dyn SessionStore>,
    session: ChatSession,
    checkpoint: usize,
    created: bool,
    state: TransactionState,
}

impl TurnTransaction {
    pub fn begin(store: Arc<dyn SessionStore>, session: ChatSession, created: bool) -> Self {
        let checkpoint = session.messages.len();
        Self {
            store,
            session,
            checkpoint,
            created,
            state: TransactionState::Open,
        }
    }

    pub fn session(&self) -> &ChatSession {
        &self.session
    }

    /// Whether this turn created the session.
    pub fn created(&self) -> bool {
        self.created
    }

    pub async fn commit(&mut self, prompt: &str, assistant: ChatMessage) -> Result<(), TurnError> {
        if self.state != TransactionState::Open {
            return Err(TurnError::Finished);
        }

        let pair = [ChatMessage::user(prompt), assistant];
        let title = self
            .session
            .has_placeholder_title()
            .then(|| title_from_prompt(prompt, COMMIT_TITLE_CHARS));

        self.session.messages.extend_from_slice(&pair);

        let appended = self
            .store
            .append_turn(
                &self.session.id,
                &self.session.user_id,
                &pair,
                title.as_deref(),
            )
            .await;

        match appended {
            Ok(true) => {
                if let Some(title) = title {
                    self.session.title = Some(title);
                }
                self.state = TransactionState::Committed;
                Ok(())
            }
            Ok(false) => {
                self.session.messages.truncate(self.checkpoint);
                Err(TurnError::SessionVanished(self.session.id_hex()))
            }
            Err(e) => {
                self.session.messages.truncate(self.checkpoint);
                Err(e.into())
            }
        }
    }

    /// Undo the turn. A no-op once committed or rolled back.
    pub async fn rollback(&mut self) -> Result<(), StoreError> {
        if self.state != TransactionState::Open {
            return Ok(());
        }

        self.session.messages.truncate(self.checkpoint);
        self.state = TransactionState::RolledBack;

        if self.created {
            let deleted = self
                .store
                .delete(&self.session.id, &self.session.user_id)
                .await?;
            tracing::info!(
                session_id = %self.session.id,
                deleted,
                "Removed session created by failed turn"
            );
        }

        Ok(())
    }
}
