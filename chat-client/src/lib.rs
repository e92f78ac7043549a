//! chat-client: consumes the chat service's event stream and keeps the
//! client-side view of a conversation consistent with it.
pub mod client;
pub mod conversation;
pub mod error;
pub mod parser;
pub mod state;

pub use client::{ChatClient, ChatClientConfig, FrameStream};
pub use conversation::Conversation;
pub use error::ClientError;
pub use parser::{FrameParser, RawFrame, SnapshotFeed};
pub use state::{ConversationState, Phase, SendRequest, StateError, Transition, TurnId, TurnOutcome};
