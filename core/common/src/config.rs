//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::hash::HashType;
use crate::Result;

/// Tunables shared by the compare engine, the job queue and the workers.
///
/// Durations are written as whole seconds in the JSON form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of concurrent workers.
    pub workers: usize,
    /// How often an idle worker polls the queue.
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    /// Processing deadline of one job, counted from dequeue.
    #[serde(with = "duration_secs")]
    pub job_deadline: Duration,
    /// Safety-net TTL of the dataset lock.
    #[serde(with = "duration_secs")]
    pub lock_ttl: Duration,
    /// TTL of per-node progress markers and terminal error markers.
    #[serde(with = "duration_secs")]
    pub progress_ttl: Duration,
    /// TTL of compare results waiting to be polled.
    #[serde(with = "duration_secs")]
    pub compare_ttl: Duration,
    /// Failed attempts tolerated before a job is dropped.
    pub max_retries: u32,
    /// Upper bound of the back-off slept before a failed job is re-queued.
    #[serde(with = "duration_secs")]
    pub retry_backoff_cap: Duration,
    /// Listing polls after a legacy deposit before giving up.
    pub registration_poll_attempts: u32,
    /// Fixed delay between listing polls.
    #[serde(with = "duration_secs")]
    pub registration_poll_delay: Duration,
    /// Flush KnownHashes every this many nodes.
    pub cache_flush_every: usize,
    /// Algorithm the destination stores checksums in.
    pub default_hash: HashType,
    /// Maximum accepted file size in bytes, 0 for unlimited.
    pub max_file_size: u64,
    /// Report `New` whenever any node already had a local hash. When off,
    /// `New` means some file still differs from the source.
    pub literal_new_status: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_secs(1),
            job_deadline: Duration::from_secs(2 * 60 * 60),
            lock_ttl: Duration::from_secs(24 * 60 * 60),
            progress_ttl: Duration::from_secs(5 * 60),
            compare_ttl: Duration::from_secs(5 * 60),
            max_retries: 3,
            retry_backoff_cap: Duration::from_secs(60),
            registration_poll_attempts: 5,
            registration_poll_delay: Duration::from_secs(1),
            cache_flush_every: 10,
            default_hash: HashType::Md5,
            max_file_size: 0,
            literal_new_status: true,
        }
    }
}

impl EngineConfig {
    /// Parse from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read a JSON config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
