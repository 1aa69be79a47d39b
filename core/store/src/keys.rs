//! Keyspace of the shared store.
//!
//! These strings are shared with existing deployments and must not change.

/// The job queue list.
pub const JOBS: &str = "jobs";

/// Progress marker value for a node that was written.
pub const WRITTEN: &str = "written";

/// Progress marker value for a node that was deleted.
pub const DELETED: &str = "deleted";

/// Dataset lock.
pub fn lock(dataset: &str) -> String {
    format!("lock: {}", dataset)
}

/// KnownHashes cache of a dataset.
pub fn hashes(dataset: &str) -> String {
    format!("hashes: {}", dataset)
}

/// Per-node progress marker.
pub fn progress(dataset: &str, node: &str) -> String {
    format!("{} -> {}", dataset, node)
}

/// Terminal failure message of the last job for a dataset.
pub fn job_error(dataset: &str) -> String {
    format!("error {}", dataset)
}
