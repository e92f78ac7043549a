//! Client-side view of one conversation.
//!
//! The state machine is synchronous and single-writer: the driver feeds it
//! frames in arrival order and tells it when the network call ended. Every
//! frame is tagged with the turn that produced it, so frames from a turn
//! that is no longer pending are ignored.

use chrono::Utc;
use service_core::chat::{
    Frame, KeyClass, MessageView, Role, SessionView, StreamRequest, TokenUsage, TurnMetadata,
};
use thiserror::Error;

/// Identifies one submitted turn.
pub type TurnId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Sending,
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    Failed(String),
    Cancelled,
}

/// Network call to issue for a submitted turn.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub turn: TurnId,
    pub body: StreamRequest,
}

/// Effect of applying one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Nothing changed: stale turn, unknown event or repeated conversation id.
    None,
    /// The turn adopted this conversation id.
    Adopted(String),
    /// The placeholder changed.
    Updated,
    /// The turn reached a terminal state.
    Finished(TurnOutcome),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    #[error("A message is still streaming")]
    Busy,
}

#[derive(Debug, Clone)]
struct PendingTurn {
    id: TurnId,
    placeholder: usize,
    adopted: bool,
}

#[derive(Debug, Default)]
pub struct ConversationState {
    messages: Vec<MessageView>,
    sessions: Vec<SessionView>,
    active_session: Option<String>,
    pending: Option<PendingTurn>,
    next_turn: TurnId,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        if self.pending.is_some() {
            Phase::Sending
        } else {
            Phase::Idle
        }
    }

    pub fn messages(&self) -> &[MessageView] {
        &self.messages
    }

    pub fn sessions(&self) -> &[SessionView] {
        &self.sessions
    }

    pub fn active_session(&self) -> Option<&str> {
        self.active_session.as_deref()
    }

    pub fn pending_turn(&self) -> Option<TurnId> {
        self.pending.as_ref().map(|pending| pending.id)
    }

    /// Start a turn.
    ///
    /// Returns `None` for a blank prompt or while another turn is pending.
    /// Otherwise the user message and an empty assistant placeholder are
    /// appended and the request to send is returned.
    pub fn submit(&mut self, prompt: &str, api_key: Option<&str>) -> Option<SendRequest> {
        let prompt = prompt.trim();
        if prompt.is_empty() || self.pending.is_some() {
            return None;
        }

        let api_key = api_key
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .map(str::to_string);
        let key_class = if api_key.is_some() {
            KeyClass::Custom
        } else {
            KeyClass::Default
        };

        self.messages.push(message(Role::User, prompt, None));
        self.messages.push(message(Role::Assistant, "", Some(key_class)));

        self.next_turn += 1;
        let turn = self.next_turn;
        self.pending = Some(PendingTurn {
            id: turn,
            placeholder: self.messages.len() - 1,
            adopted: false,
        });

        Some(SendRequest {
            turn,
            body: StreamRequest {
                prompt: Some(prompt.to_string()),
                conversation_id: self.active_session.clone(),
                api_key,
            },
        })
    }

    /// Apply one frame of `turn`.
    pub fn apply(&mut self, turn: TurnId, frame: Frame) -> Transition {
        let Some(pending) = self.pending.as_mut().filter(|pending| pending.id == turn) else {
            return Transition::None;
        };
        let placeholder = pending.placeholder;

        match frame {
            Frame::Conversation(id) => {
                if pending.adopted || id.is_empty() {
                    return Transition::None;
                }
                pending.adopted = true;
                self.active_session = Some(id.clone());
                Transition::Adopted(id)
            }
            Frame::Delta(text) => match self.messages.get_mut(placeholder) {
                Some(target) => {
                    target.content.push_str(&text);
                    Transition::Updated
                }
                None => Transition::None,
            },
            Frame::Metadata(metadata) => match self.messages.get_mut(placeholder) {
                Some(target) => {
                    merge_metadata(target, metadata);
                    Transition::Updated
                }
                None => Transition::None,
            },
            Frame::Error(message) => self.fail(turn, &message),
            Frame::Done => {
                self.pending = None;
                Transition::Finished(TurnOutcome::Completed)
            }
        }
    }

    /// End `turn` as failed, showing `message` in place of the answer.
    ///
    /// The user message stays visible.
    pub fn fail(&mut self, turn: TurnId, message: &str) -> Transition {
        let Some(pending) = self.take_pending(turn) else {
            return Transition::None;
        };
        if let Some(target) = self.messages.get_mut(pending.placeholder) {
            target.content = message.to_string();
        }
        Transition::Finished(TurnOutcome::Failed(message.to_string()))
    }

    /// End `turn` as cancelled. The placeholder is discarded.
    pub fn cancel(&mut self, turn: TurnId) -> Transition {
        let Some(pending) = self.take_pending(turn) else {
            return Transition::None;
        };
        if pending.placeholder < self.messages.len() {
            self.messages.remove(pending.placeholder);
        }
        Transition::Finished(TurnOutcome::Cancelled)
    }

    fn take_pending(&mut self, turn: TurnId) -> Option<PendingTurn> {
        if self.pending_turn() == Some(turn) {
            self.pending.take()
        } else {
            None
        }
    }

    /// Show a stored session.
    pub fn select_session(&mut self, id: &str) -> Result<(), StateError> {
        self.ensure_idle()?;
        self.messages = self
            .find_session(id)
            .map(|session| session.messages.clone())
            .unwrap_or_default();
        self.active_session = Some(id.to_string());
        Ok(())
    }

    /// Clear the view; the next turn creates a new session.
    pub fn start_new(&mut self) -> Result<(), StateError> {
        self.ensure_idle()?;
        self.reset_view();
        Ok(())
    }

    /// Replace the session list with a fresh listing.
    pub fn set_sessions(&mut self, sessions: Vec<SessionView>) {
        self.sessions = sessions;
    }

    /// Bring the view in line with a fresh listing after a turn ended.
    ///
    /// A completed turn is replaced by the stored messages of the active
    /// session. After a failure, an active session missing from the listing
    /// was removed by the server and is forgotten.
    pub fn reconcile(&mut self, outcome: &TurnOutcome, sessions: Vec<SessionView>) {
        self.sessions = sessions;
        if self.pending.is_some() {
            return;
        }
        let Some(active) = self.active_session.clone() else {
            return;
        };

        match (outcome, self.find_session(&active)) {
            (TurnOutcome::Completed, Some(session)) if !session.messages.is_empty() => {
                self.messages = session.messages.clone();
            }
            (TurnOutcome::Completed, _) => {}
            (_, None) => self.active_session = None,
            (_, Some(_)) => {}
        }
    }

    /// Update a session after a successful rename.
    pub fn apply_rename(&mut self, renamed: &SessionView) {
        if let Some(session) = self.sessions.iter_mut().find(|s| s.id == renamed.id) {
            session.title = renamed.title.clone();
        }
    }

    /// Drop a deleted session. Deleting the active one resets the view.
    pub fn remove_session(&mut self, id: &str) {
        self.sessions.retain(|session| session.id != id);
        if self.active_session.as_deref() == Some(id) {
            self.pending = None;
            self.reset_view();
        }
    }

    fn find_session(&self, id: &str) -> Option<&SessionView> {
        self.sessions.iter().find(|session| session.id == id)
    }

    fn ensure_idle(&self) -> Result<(), StateError> {
        match self.phase() {
            Phase::Idle => Ok(()),
            Phase::Sending => Err(StateError::Busy),
        }
    }

    fn reset_view(&mut self) {
        self.active_session = None;
        self.messages.clear();
    }
}

fn message(role: Role, content: &str, api_key_type: Option<KeyClass>) -> MessageView {
    MessageView {
        role,
        content: content.to_string(),
        created_at: Some(Utc::now()),
        usage: None,
        duration_ms: None,
        source_count: None,
        sources: Vec::new(),
        api_key_type,
    }
}

/// Merge reported fields into the placeholder. Absent fields keep their value.
fn merge_metadata(target: &mut MessageView, metadata: TurnMetadata) {
    if let Some(usage) = metadata.usage {
        let current = target.usage.get_or_insert_with(TokenUsage::default);
        current.input_tokens = usage.input_tokens.or(current.input_tokens);
        current.output_tokens = usage.output_tokens.or(current.output_tokens);
        current.total_tokens = usage.total_tokens.or(current.total_tokens);
    }
    if metadata.duration_ms.is_some() {
        target.duration_ms = metadata.duration_ms;
    }
    if metadata.source_count.is_some() {
        target.source_count = metadata.source_count;
    }
    if let Some(sources) = metadata.sources {
        target.sources = sources;
    }
    if metadata.api_key_type.is_some() {
        target.api_key_type = metadata.api_key_type;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use service_core::chat::Source;

    const SESSION: &str = "65f0c1d2e3a4b5c6d7e8f901";

    fn stored_session(id: &str, pairs: usize) -> SessionView {
        let mut messages = Vec::new();
        for n in 0..pairs {
            messages.push(message(Role::User, &format!("question {}", n), None));
            messages.push(message(
                Role::Assistant,
                &format!("answer {}", n),
                Some(KeyClass::Default),
            ));
        }
        SessionView {
            id: id.to_string(),
            title: Some("question 0".to_string()),
            messages,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn placeholder(state: &ConversationState) -> &MessageView {
        state.messages().last().unwrap()
    }

    #[test]
    fn test_submit_appends_user_and_placeholder() {
        let mut state = ConversationState::new();
        let request = state.submit("  What is X?  ", None).unwrap();

        assert_eq!(request.body.prompt.as_deref(), Some("What is X?"));
        assert_eq!(request.body.conversation_id, None);
        assert_eq!(request.body.api_key, None);
        assert_eq!(state.phase(), Phase::Sending);

        assert_eq!(state.messages().len(), 2);
        assert_eq!(state.messages()[0].role, Role::User);
        assert_eq!(state.messages()[0].content, "What is X?");
        assert_eq!(placeholder(&state).role, Role::Assistant);
        assert_eq!(placeholder(&state).content, "");
        assert_eq!(placeholder(&state).api_key_type, Some(KeyClass::Default));
    }

    #[test]
    fn test_submit_is_noop_when_blank_or_pending() {
        let mut state = ConversationState::new();
        assert!(state.submit("   ", None).is_none());
        assert!(state.messages().is_empty());

        state.submit("first", None).unwrap();
        assert!(state.submit("second", None).is_none());
        assert_eq!(state.messages().len(), 2);
    }

    #[test]
    fn test_submit_with_key_marks_placeholder_custom() {
        let mut state = ConversationState::new();
        let request = state.submit("hi", Some(" pplx-key ")).unwrap();
        assert_eq!(request.body.api_key.as_deref(), Some("pplx-key"));
        assert_eq!(placeholder(&state).api_key_type, Some(KeyClass::Custom));

        state.apply(request.turn, Frame::Done);
        let request = state.submit("again", Some("  ")).unwrap();
        assert_eq!(request.body.api_key, None);
    }

    #[test]
    fn test_deltas_concatenate_in_order() {
        let mut state = ConversationState::new();
        let turn = state.submit("hi", None).unwrap().turn;

        assert_eq!(
            state.apply(turn, Frame::Conversation(SESSION.to_string())),
            Transition::Adopted(SESSION.to_string())
        );
        for text in ["Hel", "lo", ", ", "world"] {
            assert_eq!(
                state.apply(turn, Frame::Delta(text.to_string())),
                Transition::Updated
            );
        }
        assert_eq!(placeholder(&state).content, "Hello, world");
        assert_eq!(state.active_session(), Some(SESSION));

        assert_eq!(
            state.apply(turn, Frame::Done),
            Transition::Finished(TurnOutcome::Completed)
        );
        assert_eq!(state.phase(), Phase::Idle);
    }

    #[test]
    fn test_conversation_adopted_once_per_turn() {
        let mut state = ConversationState::new();
        let turn = state.submit("hi", None).unwrap().turn;
        state.apply(turn, Frame::Conversation(SESSION.to_string()));
        assert_eq!(
            state.apply(turn, Frame::Conversation("other".to_string())),
            Transition::None
        );
        assert_eq!(state.active_session(), Some(SESSION));
    }

    #[test]
    fn test_next_turn_targets_adopted_session() {
        let mut state = ConversationState::new();
        let turn = state.submit("hi", None).unwrap().turn;
        state.apply(turn, Frame::Conversation(SESSION.to_string()));
        state.apply(turn, Frame::Done);

        let request = state.submit("follow up", None).unwrap();
        assert_eq!(request.body.conversation_id.as_deref(), Some(SESSION));
    }

    #[test]
    fn test_null_source_count_does_not_erase() {
        let mut state = ConversationState::new();
        let turn = state.submit("hi", None).unwrap().turn;

        state.apply(
            turn,
            Frame::Metadata(TurnMetadata {
                usage: Some(TokenUsage {
                    input_tokens: Some(4),
                    output_tokens: Some(9),
                    total_tokens: Some(13),
                }),
                duration_ms: Some(700),
                source_count: Some(2),
                sources: Some(vec![Source {
                    url: "https://a.example".to_string(),
                    title: None,
                }]),
                api_key_type: Some(KeyClass::Default),
            }),
        );

        let later: TurnMetadata =
            serde_json::from_str(r#"{"sourceCount":null,"usage":{"outputTokens":11}}"#).unwrap();
        state.apply(turn, Frame::Metadata(later));

        let target = placeholder(&state);
        assert_eq!(target.source_count, Some(2));
        assert_eq!(target.duration_ms, Some(700));
        assert_eq!(target.sources.len(), 1);
        let usage = target.usage.as_ref().unwrap();
        assert_eq!(usage.input_tokens, Some(4));
        assert_eq!(usage.output_tokens, Some(11));
        assert_eq!(usage.total_tokens, Some(13));
    }

    #[test]
    fn test_error_frame_replaces_placeholder_keeps_user_message() {
        let mut state = ConversationState::new();
        let turn = state.submit("hi", None).unwrap().turn;
        state.apply(turn, Frame::Delta("partial".to_string()));

        let transition = state.apply(turn, Frame::Error("Stream interrupted".to_string()));
        assert_eq!(
            transition,
            Transition::Finished(TurnOutcome::Failed("Stream interrupted".to_string()))
        );
        assert_eq!(state.messages().len(), 2);
        assert_eq!(state.messages()[0].content, "hi");
        assert_eq!(placeholder(&state).content, "Stream interrupted");
        assert_eq!(state.phase(), Phase::Idle);
    }

    #[test]
    fn test_cancel_discards_placeholder() {
        let mut state = ConversationState::new();
        let turn = state.submit("hi", None).unwrap().turn;
        state.apply(turn, Frame::Delta("partial".to_string()));

        assert_eq!(
            state.cancel(turn),
            Transition::Finished(TurnOutcome::Cancelled)
        );
        assert_eq!(state.messages().len(), 1);
        assert_eq!(state.messages()[0].role, Role::User);
        assert_eq!(state.cancel(turn), Transition::None);
    }

    #[test]
    fn test_frames_of_finished_turn_are_ignored() {
        let mut state = ConversationState::new();
        let turn = state.submit("hi", None).unwrap().turn;
        state.apply(turn, Frame::Done);

        assert_eq!(
            state.apply(turn, Frame::Delta("late".to_string())),
            Transition::None
        );
        assert_eq!(placeholder(&state).content, "");
    }

    #[test]
    fn test_switching_while_sending_is_rejected() {
        let mut state = ConversationState::new();
        state.submit("hi", None).unwrap();
        assert_eq!(state.start_new(), Err(StateError::Busy));
        assert_eq!(state.select_session(SESSION), Err(StateError::Busy));
        assert_eq!(state.messages().len(), 2);
    }

    #[test]
    fn test_select_session_loads_stored_messages() {
        let mut state = ConversationState::new();
        state.set_sessions(vec![stored_session(SESSION, 2)]);

        state.select_session(SESSION).unwrap();
        assert_eq!(state.messages().len(), 4);
        assert_eq!(state.active_session(), Some(SESSION));

        state.start_new().unwrap();
        assert!(state.messages().is_empty());
        assert_eq!(state.active_session(), None);
    }

    #[test]
    fn test_reconcile_after_done_uses_stored_messages() {
        let mut state = ConversationState::new();
        let turn = state.submit("question 0", None).unwrap().turn;
        state.apply(turn, Frame::Conversation(SESSION.to_string()));
        state.apply(turn, Frame::Delta("answer".to_string()));
        state.apply(turn, Frame::Done);

        state.reconcile(&TurnOutcome::Completed, vec![stored_session(SESSION, 1)]);
        assert_eq!(state.messages().len(), 2);
        assert_eq!(state.messages()[1].content, "answer 0");
        assert_eq!(state.sessions().len(), 1);
    }

    #[test]
    fn test_reconcile_after_failure_forgets_removed_session() {
        let mut state = ConversationState::new();
        let turn = state.submit("hi", None).unwrap().turn;
        state.apply(turn, Frame::Conversation(SESSION.to_string()));
        let outcome = match state.apply(turn, Frame::Error("Stream interrupted".to_string())) {
            Transition::Finished(outcome) => outcome,
            other => panic!("unexpected transition {:?}", other),
        };

        state.reconcile(&outcome, Vec::new());
        assert_eq!(state.active_session(), None);
        assert_eq!(placeholder(&state).content, "Stream interrupted");

        let request = state.submit("retry", None).unwrap();
        assert_eq!(request.body.conversation_id, None);
    }

    #[test]
    fn test_rename_and_remove_session() {
        let mut state = ConversationState::new();
        state.set_sessions(vec![stored_session(SESSION, 1)]);
        state.select_session(SESSION).unwrap();

        let mut renamed = stored_session(SESSION, 1);
        renamed.title = Some("Renamed".to_string());
        state.apply_rename(&renamed);
        assert_eq!(state.sessions()[0].title.as_deref(), Some("Renamed"));

        state.remove_session(SESSION);
        assert!(state.sessions().is_empty());
        assert!(state.messages().is_empty());
        assert_eq!(state.active_session(), None);
    }
}
