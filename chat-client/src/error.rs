use crate::state::StateError;
use service_core::chat::FrameError;
use thiserror::Error;

/// User-facing text of a cancelled turn.
pub const REQUEST_CANCELLED: &str = "Request cancelled";

/// Fallback text when a failure carries no message of its own.
pub const UNABLE_TO_SEND: &str = "Unable to send message";

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Request cancelled")]
    Cancelled,

    /// The stream ended with an `error` frame.
    #[error("{0}")]
    Stream(String),

    /// Non-2xx answer; `message` is the server's `error` field.
    #[error("{message}")]
    Status { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("A message is still streaming")]
    Busy,
}

impl From<StateError> for ClientError {
    fn from(err: StateError) -> Self {
        match err {
            StateError::Busy => ClientError::Busy,
        }
    }
}

impl ClientError {
    /// Text shown in place of the assistant answer.
    pub fn user_message(&self) -> String {
        match self {
            ClientError::Cancelled => REQUEST_CANCELLED.to_string(),
            ClientError::Stream(message) | ClientError::Status { message, .. }
                if !message.trim().is_empty() =>
            {
                message.clone()
            }
            _ => UNABLE_TO_SEND.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_messages() {
        assert_eq!(ClientError::Cancelled.user_message(), "Request cancelled");
        assert_eq!(
            ClientError::Stream("Stream interrupted".to_string()).user_message(),
            "Stream interrupted"
        );
        assert_eq!(
            ClientError::Status {
                status: 400,
                message: "Prompt is required".to_string()
            }
            .user_message(),
            "Prompt is required"
        );
        assert_eq!(
            ClientError::Status {
                status: 502,
                message: String::new()
            }
            .user_message(),
            "Unable to send message"
        );
        assert_eq!(ClientError::Busy.user_message(), "Unable to send message");
    }
}
