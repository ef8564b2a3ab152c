//! HTTP API handlers for agora-api
//!
//! A thin surface for operating the pipeline: buffer votes, request imports
//! and exports, poll their status and inspect the update queue.

pub mod exports;
pub mod health;
pub mod imports;
pub mod queue;
pub mod votes;

pub use exports::export_routes;
pub use health::health_routes;
pub use imports::import_routes;
pub use queue::queue_routes;
pub use votes::vote_routes;
