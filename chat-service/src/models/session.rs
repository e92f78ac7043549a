//! Chat session documents.
//!
//! A session embeds its full message list. Messages are only ever appended
//! in user/assistant pairs, one pair per completed turn.

use chrono::{DateTime, Utc};
use mongodb::bson::oid::ObjectId;
use serde::{Deserialize, Serialize};
use service_core::chat::{KeyClass, Role, Source, TokenUsage};

/// Placeholder title for sessions created without a usable prompt.
pub const DEFAULT_TITLE: &str = "Conversation";

/// Title the client shows before the first turn completes.
const NEW_CONVERSATION_TITLE: &str = "New Conversation";

/// Prompt prefix length used as the title of a freshly created session.
pub const CREATE_TITLE_CHARS: usize = 60;

/// Prompt prefix length used when a placeholder title is replaced on commit.
pub const COMMIT_TITLE_CHARS: usize = 80;

/// Upper bound for user-supplied titles.
pub const MAX_TITLE_CHARS: usize = 120;

/// First `max_chars` characters of the prompt, or the placeholder title.
pub fn title_from_prompt(prompt: &str, max_chars: usize) -> String {
    let title: String = prompt.trim().chars().take(max_chars).collect();
    if title.is_empty() {
        DEFAULT_TITLE.to_string()
    } else {
        title
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_count: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Source>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key_type: Option<KeyClass>,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            created_at: Utc::now(),
            usage: None,
            duration_ms: None,
            source_count: None,
            sources: Vec::new(),
            api_key_type: None,
        }
    }

    pub fn assistant(
        content: impl Into<String>,
        usage: Option<TokenUsage>,
        duration_ms: u64,
        sources: Vec<Source>,
        key_class: KeyClass,
    ) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            created_at: Utc::now(),
            usage,
            duration_ms: Some(duration_ms),
            source_count: Some(sources.len() as u32),
            sources,
            api_key_type: Some(key_class),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatSession {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub updated_at: DateTime<Utc>,
}

impl ChatSession {
    pub fn new(user_id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: ObjectId::new(),
            user_id: user_id.into(),
            title: Some(title.into()),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id_hex(&self) -> String {
        self.id.to_hex()
    }

    /// True when the title was never set from real content.
    pub fn has_placeholder_title(&self) -> bool {
        match self.title.as_deref().map(str::trim) {
            None | Some("") => true,
            Some(title) => title == DEFAULT_TITLE || title == NEW_CONVERSATION_TITLE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson;

    #[test]
    fn test_title_from_prompt_truncates_on_char_boundary() {
        let prompt = "é".repeat(100);
        let title = title_from_prompt(&prompt, CREATE_TITLE_CHARS);
        assert_eq!(title.chars().count(), 60);
    }

    #[test]
    fn test_title_from_prompt_defaults_when_blank() {
        assert_eq!(title_from_prompt("   ", COMMIT_TITLE_CHARS), DEFAULT_TITLE);
        assert_eq!(title_from_prompt("What is X?", 60), "What is X?");
    }

    #[test]
    fn test_placeholder_titles() {
        let mut session = ChatSession::new("user_1", DEFAULT_TITLE);
        assert!(session.has_placeholder_title());

        session.title = Some("New Conversation".to_string());
        assert!(session.has_placeholder_title());

        session.title = None;
        assert!(session.has_placeholder_title());

        session.title = Some("Rust lifetimes".to_string());
        assert!(!session.has_placeholder_title());
    }

    #[test]
    fn test_assistant_message_counts_sources() {
        let message = ChatMessage::assistant(
            "answer",
            None,
            1200,
            vec![Source {
                url: "https://example.com/a".to_string(),
                title: None,
            }],
            KeyClass::Custom,
        );
        assert_eq!(message.source_count, Some(1));
        assert_eq!(message.duration_ms, Some(1200));
        assert_eq!(message.api_key_type, Some(KeyClass::Custom));
    }

    #[test]
    fn test_session_bson_round_trip() {
        let mut session = ChatSession::new("user_1", "Title");
        session.messages.push(ChatMessage::user("hello"));

        let document = bson::to_document(&session).unwrap();
        assert!(document.get_object_id("_id").is_ok());
        assert!(document.get_i64("updated_at").is_ok());

        let decoded: ChatSession = bson::from_document(document).unwrap();
        assert_eq!(decoded.id, session.id);
        assert_eq!(decoded.messages.len(), 1);
        assert_eq!(decoded.messages[0].role, Role::User);
    }
}
