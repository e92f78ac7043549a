use crate::models::{ChatMessage, ChatSession};
use service_core::chat::{MessageView, SessionView};
use validator::Validate;

/// Validated rename body. The title is already trimmed.
#[derive(Debug, Validate)]
pub struct RenameInput {
    #[validate(length(
        min = 1,
        max = 120,
        message = "Title must be between 1 and 120 characters"
    ))]
    pub title: String,
}

impl From<ChatMessage> for MessageView {
    fn from(message: ChatMessage) -> Self {
        MessageView {
            role: message.role,
            content: message.content,
            created_at: Some(message.created_at),
            usage: message.usage,
            duration_ms: message.duration_ms,
            source_count: message.source_count,
            sources: message.sources,
            api_key_type: message.api_key_type,
        }
    }
}

impl From<ChatSession> for SessionView {
    fn from(session: ChatSession) -> Self {
        SessionView {
            id: session.id.to_hex(),
            title: session.title,
            messages: session.messages.into_iter().map(MessageView::from).collect(),
            created_at: session.created_at,
            updated_at: session.updated_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use service_core::chat::{KeyClass, Role};

    #[test]
    fn test_session_view_uses_hex_id() {
        let mut session = ChatSession::new("user_1", "Title");
        session.messages.push(ChatMessage::user("question"));
        session.messages.push(ChatMessage::assistant(
            "answer",
            None,
            10,
            Vec::new(),
            KeyClass::Default,
        ));

        let id = session.id.to_hex();
        let view = SessionView::from(session);
        assert_eq!(view.id, id);
        assert_eq!(view.messages.len(), 2);
        assert_eq!(view.messages[1].role, Role::Assistant);
        assert_eq!(view.messages[1].source_count, Some(0));
    }

    #[test]
    fn test_rename_input_bounds() {
        let ok = RenameInput {
            title: "x".repeat(120),
        };
        assert!(ok.validate().is_ok());

        let too_long = RenameInput {
            title: "x".repeat(121),
        };
        assert!(too_long.validate().is_err());

        let empty = RenameInput {
            title: String::new(),
        };
        assert!(empty.validate().is_err());
    }
}
