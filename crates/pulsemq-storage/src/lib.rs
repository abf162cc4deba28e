//! PulseMQ Storage - Snapshot backends for the message broker
//!
//! This crate provides pluggable snapshot stores.
//! Currently supports:
//! - File storage (one JSON file per queue, atomic replace)
//! - In-memory storage (default feature, for tests and ephemeral brokers)

pub mod file;
pub mod traits;

#[cfg(feature = "memory")]
pub mod memory;

// Re-exports
pub use file::FileStore;
pub use traits::SnapshotStore;

#[cfg(feature = "memory")]
pub use memory::MemoryStore;
