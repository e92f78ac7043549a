pub mod database;
pub mod memory;
pub mod metrics;
pub mod providers;
pub mod store;

pub use database::MongoSessionStore;
pub use memory::InMemorySessionStore;
pub use metrics::{get_metrics, init_metrics};
pub use store::{parse_session_id, SessionStore, StoreError};
