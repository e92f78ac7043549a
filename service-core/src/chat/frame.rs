//! Frame encoding for the chat stream.
//!
//! Every frame is two lines, `event: <tag>` and `data: <payload>`, followed
//! by a blank line. Payloads never contain a raw newline: `delta`, `metadata`
//! and `error` carry compact JSON, `conversation` carries the session id and
//! `done` carries [`DONE_SENTINEL`].

use super::types::TurnMetadata;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Separator between two frames.
pub const FRAME_SEPARATOR: &str = "\n\n";

/// Payload of the `done` frame.
pub const DONE_SENTINEL: &str = "ok";

/// User-facing message carried by the `error` frame.
pub const STREAM_INTERRUPTED: &str = "Stream interrupted";

/// Header carrying the authenticated user id from the identity proxy.
pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Malformed {event} payload: {source}")]
    Payload {
        event: FrameEvent,
        #[source]
        source: serde_json::Error,
    },
}

/// Event tag of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameEvent {
    Conversation,
    Delta,
    Metadata,
    Error,
    Done,
}

impl FrameEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameEvent::Conversation => "conversation",
            FrameEvent::Delta => "delta",
            FrameEvent::Metadata => "metadata",
            FrameEvent::Error => "error",
            FrameEvent::Done => "done",
        }
    }

    /// Parse an event name; unknown names yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "conversation" => Some(FrameEvent::Conversation),
            "delta" => Some(FrameEvent::Delta),
            "metadata" => Some(FrameEvent::Metadata),
            "error" => Some(FrameEvent::Error),
            "done" => Some(FrameEvent::Done),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FrameEvent::Error | FrameEvent::Done)
    }
}

impl fmt::Display for FrameEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct DeltaPayload {
    text: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct ErrorPayload {
    #[serde(default)]
    message: Option<String>,
}

/// A typed event of the chat stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Session id adopted by this turn. Always first.
    Conversation(String),
    /// One provider token chunk, verbatim.
    Delta(String),
    /// Usage, duration and sources. Exactly once, after the last delta.
    Metadata(TurnMetadata),
    /// Terminal failure with a user-facing message.
    Error(String),
    /// Terminal success.
    Done,
}

impl Frame {
    pub fn event(&self) -> FrameEvent {
        match self {
            Frame::Conversation(_) => FrameEvent::Conversation,
            Frame::Delta(_) => FrameEvent::Delta,
            Frame::Metadata(_) => FrameEvent::Metadata,
            Frame::Error(_) => FrameEvent::Error,
            Frame::Done => FrameEvent::Done,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.event().is_terminal()
    }

    /// Text placed after `data: `.
    pub fn payload(&self) -> Result<String, FrameError> {
        let event = self.event();
        let to_json = |value: serde_json::Result<String>| {
            value.map_err(|source| FrameError::Payload { event, source })
        };

        match self {
            Frame::Conversation(id) => Ok(id.clone()),
            Frame::Delta(text) => to_json(serde_json::to_string(&DeltaPayload {
                text: text.clone(),
            })),
            Frame::Metadata(metadata) => to_json(serde_json::to_string(metadata)),
            Frame::Error(message) => to_json(serde_json::to_string(&ErrorPayload {
                message: Some(message.clone()),
            })),
            Frame::Done => Ok(DONE_SENTINEL.to_string()),
        }
    }

    /// Serialize to the wire form, separator included.
    pub fn encode(&self) -> Result<String, FrameError> {
        let payload = self.payload()?;
        debug_assert!(!payload.contains('\n'), "frame payloads are single-line");
        Ok(format!(
            "event: {}\ndata: {}{}",
            self.event(),
            payload,
            FRAME_SEPARATOR
        ))
    }

    /// Build a typed frame from a decoded event name and data payload.
    ///
    /// Unknown event names are not an error; they yield `Ok(None)`.
    pub fn decode(event: &str, data: &str) -> Result<Option<Frame>, FrameError> {
        let Some(kind) = FrameEvent::parse(event) else {
            return Ok(None);
        };

        let frame = match kind {
            FrameEvent::Conversation => Frame::Conversation(data.trim().to_string()),
            FrameEvent::Delta => {
                let payload: DeltaPayload = serde_json::from_str(data)
                    .map_err(|source| FrameError::Payload { event: kind, source })?;
                Frame::Delta(payload.text)
            }
            FrameEvent::Metadata => {
                let metadata: TurnMetadata = serde_json::from_str(data)
                    .map_err(|source| FrameError::Payload { event: kind, source })?;
                Frame::Metadata(metadata)
            }
            FrameEvent::Error => {
                // A non-JSON error payload is shown as-is.
                let message = match serde_json::from_str::<ErrorPayload>(data) {
                    Ok(ErrorPayload {
                        message: Some(message),
                    }) => message,
                    Ok(ErrorPayload { message: None }) => "Stream failed".to_string(),
                    Err(_) => data.to_string(),
                };
                Frame::Error(message)
            }
            FrameEvent::Done => Frame::Done,
        };

        Ok(Some(frame))
    }
}
