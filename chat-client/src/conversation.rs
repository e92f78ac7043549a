//! Drives [`ConversationState`] over a [`ChatClient`].

use crate::client::ChatClient;
use crate::error::{ClientError, UNABLE_TO_SEND};
use crate::state::{ConversationState, Phase, SendRequest, Transition, TurnId, TurnOutcome};
use futures::StreamExt;
use secrecy::{ExposeSecret, Secret};
use service_core::chat::{MessageView, SessionView};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

const EVENT_BUFFER: usize = 64;

/// One conversation context: at most one turn in flight.
///
/// Cloning yields another handle to the same conversation, so one task can
/// `send` while another calls `cancel`.
#[derive(Clone)]
pub struct Conversation {
    client: ChatClient,
    state: Arc<Mutex<ConversationState>>,
    api_key: Arc<Mutex<Option<Secret<String>>>>,
    in_flight: Arc<Mutex<Option<(TurnId, CancellationToken)>>>,
    events: broadcast::Sender<Transition>,
}

impl Conversation {
    pub fn new(client: ChatClient) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            client,
            state: Arc::new(Mutex::new(ConversationState::new())),
            api_key: Arc::new(Mutex::new(None)),
            in_flight: Arc::new(Mutex::new(None)),
            events,
        }
    }

    /// Transitions applied by this conversation, as they happen.
    pub fn subscribe(&self) -> broadcast::Receiver<Transition> {
        self.events.subscribe()
    }

    pub async fn phase(&self) -> Phase {
        self.state.lock().await.phase()
    }

    pub async fn messages(&self) -> Vec<MessageView> {
        self.state.lock().await.messages().to_vec()
    }

    pub async fn sessions(&self) -> Vec<SessionView> {
        self.state.lock().await.sessions().to_vec()
    }

    pub async fn active_session(&self) -> Option<String> {
        self.state.lock().await.active_session().map(str::to_string)
    }

    /// Send `prompt` and follow the turn to its end.
    ///
    /// Returns `Ok(None)` for a blank prompt and `ClientError::Busy` while
    /// another turn is in flight. Every other ending, including failures
    /// and cancellation, is reported as a [`TurnOutcome`].
    #[tracing::instrument(skip(self, prompt))]
    pub async fn send(&self, prompt: &str) -> Result<Option<TurnOutcome>, ClientError> {
        let api_key = self
            .api_key
            .lock()
            .await
            .as_ref()
            .map(|key| key.expose_secret().clone());

        // The token is installed before the state lock is released, so a
        // `cancel` that observes `Phase::Sending` always reaches this turn.
        let (request, token) = {
            let mut state = self.state.lock().await;
            if state.phase() == Phase::Sending {
                return Err(ClientError::Busy);
            }
            let request = match state.submit(prompt, api_key.as_deref()) {
                Some(request) => request,
                None => return Ok(None),
            };
            let token = CancellationToken::new();
            *self.in_flight.lock().await = Some((request.turn, token.clone()));
            (request, token)
        };
        let turn = request.turn;

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => self.fail(turn, &ClientError::Cancelled).await,
            outcome = self.follow(request) => outcome,
        };

        {
            let mut in_flight = self.in_flight.lock().await;
            if matches!(in_flight.as_ref(), Some((current, _)) if *current == turn) {
                *in_flight = None;
            }
        }
        tracing::info!(turn, outcome = ?outcome, "Turn finished");

        if let Err(e) = self.reconcile(&outcome).await {
            tracing::warn!(error = %e, "Failed to refresh sessions after turn");
        }
        Ok(Some(outcome))
    }

    /// Stream the turn's frames into the state until a terminal transition.
    async fn follow(&self, request: SendRequest) -> TurnOutcome {
        let turn = request.turn;
        let mut frames = match self.client.open_turn(&request.body).await {
            Ok(frames) => frames,
            Err(e) => return self.fail(turn, &e).await,
        };

        while let Some(frame) = frames.next().await {
            let frame = match frame {
                Ok(frame) => frame,
                Err(e) => return self.fail(turn, &e).await,
            };

            let transition = self.state.lock().await.apply(turn, frame);
            if let Transition::Finished(outcome) = &transition {
                let outcome = outcome.clone();
                self.publish(transition);
                return outcome;
            }
            self.publish(transition);
        }

        self.fail(turn, &ClientError::Stream(UNABLE_TO_SEND.to_string()))
            .await
    }

    /// End `turn` on `error`. Cancellation discards the placeholder; any
    /// other error replaces it with the user-facing message.
    async fn fail(&self, turn: TurnId, error: &ClientError) -> TurnOutcome {
        let message = error.user_message();
        let (transition, outcome) = {
            let mut state = self.state.lock().await;
            match error {
                ClientError::Cancelled => {
                    tracing::info!(turn, "{}", message);
                    (state.cancel(turn), TurnOutcome::Cancelled)
                }
                _ => {
                    tracing::warn!(turn, error = %error, "Turn failed");
                    (state.fail(turn, &message), TurnOutcome::Failed(message))
                }
            }
        };
        self.publish(transition);
        outcome
    }

    fn publish(&self, transition: Transition) {
        if transition != Transition::None {
            // No subscribers is fine.
            let _ = self.events.send(transition);
        }
    }

    async fn reconcile(&self, outcome: &TurnOutcome) -> Result<(), ClientError> {
        let sessions = self.client.history().await?;
        self.state.lock().await.reconcile(outcome, sessions);
        Ok(())
    }

    /// Abort the turn in flight. No-op when idle.
    pub async fn cancel(&self) {
        if let Some((_, token)) = self.in_flight.lock().await.as_ref() {
            token.cancel();
        }
    }

    pub async fn refresh_history(&self) -> Result<Vec<SessionView>, ClientError> {
        let sessions = self.client.history().await?;
        self.state.lock().await.set_sessions(sessions.clone());
        Ok(sessions)
    }

    pub async fn select_session(&self, id: &str) -> Result<(), ClientError> {
        Ok(self.state.lock().await.select_session(id)?)
    }

    pub async fn start_new_chat(&self) -> Result<(), ClientError> {
        Ok(self.state.lock().await.start_new()?)
    }

    pub async fn rename_session(&self, id: &str, title: &str) -> Result<SessionView, ClientError> {
        let session = self.client.rename_session(id, title).await?;
        self.state.lock().await.apply_rename(&session);
        Ok(session)
    }

    pub async fn delete_session(&self, id: &str) -> Result<(), ClientError> {
        self.client.delete_session(id).await?;
        self.state.lock().await.remove_session(id);
        Ok(())
    }

    /// Use `key` for later turns. A blank key clears it.
    pub async fn save_api_key(&self, key: &str) {
        let key = key.trim();
        *self.api_key.lock().await = if key.is_empty() {
            None
        } else {
            Some(Secret::new(key.to_string()))
        };
    }

    pub async fn clear_api_key(&self) {
        *self.api_key.lock().await = None;
    }

    pub async fn has_custom_api_key(&self) -> bool {
        self.api_key.lock().await.is_some()
    }
}
