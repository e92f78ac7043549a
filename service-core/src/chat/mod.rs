//! Chat wire protocol shared by `chat-service` and `chat-client`.
//!
//! The streaming endpoint writes [`Frame`]s using a constrained event-stream
//! encoding; the JSON views describe the session REST surface.

pub mod frame;
pub mod types;

pub use frame::{
    DONE_SENTINEL, FRAME_SEPARATOR, Frame, FrameError, FrameEvent, STREAM_INTERRUPTED,
    USER_ID_HEADER,
};
pub use types::{
    DeleteResponse, ErrorBody, HistoryResponse, KeyClass, MessageView, RenameSessionRequest,
    Role, SessionResponse, SessionView, Source, StreamRequest, TokenUsage, TurnMetadata,
};
