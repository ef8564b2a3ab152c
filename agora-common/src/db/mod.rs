//! Database models and queries

pub mod init;
pub mod models;
pub mod retry;

pub use init::*;
pub use models::*;
pub use retry::{retry_on_lock, DEFAULT_MAX_LOCK_WAIT_MS};
