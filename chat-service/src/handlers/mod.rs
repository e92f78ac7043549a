pub mod chat;
pub mod health;

pub use chat::{delete_session, history, rename_session, stream_chat};
pub use health::{health_check, metrics_endpoint, readiness_check};
