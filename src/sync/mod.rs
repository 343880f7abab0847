//! Moving bytes between the sync folder and the remote.

pub mod engine;
pub mod mover;

pub use engine::{EngineConfig, SyncEngine};
pub use mover::move_file;
