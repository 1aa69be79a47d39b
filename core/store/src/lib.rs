//! rdmsync shared store
//!
//! The queue, the dataset locks, the KnownHashes cache and the progress
//! markers all live in one key-value store reachable from every worker.

pub mod keys;
pub mod memory;
pub mod sqlite;
pub mod store;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::KeyValueStore;
