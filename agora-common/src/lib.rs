//! # Agora Common Library
//!
//! Shared code for the Agora consensus-update services:
//! - Database schema and connection setup
//! - Update queue (per-conversation dirty watermark)
//! - Counter reconciliation (single shared filter predicate)
//! - Primary-store helpers (conversations, opinions, users)
//! - Event bus and user notifications
//! - Configuration loading
//! - Time helpers

pub mod config;
pub mod counters;
pub mod db;
pub mod error;
pub mod events;
pub mod notifications;
pub mod store;
pub mod time;
pub mod update_queue;

pub use error::{Error, Result};
