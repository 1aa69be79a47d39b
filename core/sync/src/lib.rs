//! rdmsync sync engine
//!
//! Compares a source selection against a dataset and pushes the chosen
//! changes through a store-backed job queue:
//! - compare with status annotation and policy filtering
//! - KnownHashes cache of cross-algorithm hash equivalences
//! - per-dataset locked job queue drained by a worker pool
//! - persist pipeline with dual-hash verification

pub mod compare;
pub mod engine;
pub mod hashes;
pub mod persist;
pub mod policy;
pub mod queue;
pub mod retry;
pub mod services;
pub mod worker;

#[cfg(test)]
mod testing;

// Re-export main types
pub use compare::{
    node_status, reconcile, Annotation, CachedResponse, CompareEngine, CompareResponse,
    OverallStatus,
};
pub use engine::{DatasetStatus, StoreRequest, SyncEngine};
pub use hashes::{CachedHashes, HashCache, KnownHashes};
pub use persist::PersistPipeline;
pub use policy::{Policy, Rejections};
pub use queue::{Job, JobQueue, HASH_ONLY};
pub use retry::{Retry, RetryConfig};
pub use services::Services;
pub use worker::WorkerPool;
