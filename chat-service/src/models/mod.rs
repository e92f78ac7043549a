//! Domain models for the chat service.

pub mod session;

pub use session::{
    title_from_prompt, ChatMessage, ChatSession, COMMIT_TITLE_CHARS, CREATE_TITLE_CHARS,
    DEFAULT_TITLE, MAX_TITLE_CHARS,
};
