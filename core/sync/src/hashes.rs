//! KnownHashes: per-dataset cache of cross-algorithm hash equivalences.
//!
//! The destination stores one checksum per file, in its own algorithm. A
//! source may declare a different one. The cache remembers, for each file,
//! which source-side digest corresponds to the checksum the destination
//! holds, so later compares need not download anything.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use rdmsync_common::{DatasetId, HashType, Result};
use rdmsync_store::{keys, KeyValueStore};
use rdmsync_tree::NodeMap;

/// Equivalences recorded for one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CachedHashes {
    pub local_hash_type: HashType,
    /// Destination checksum the entry was computed against.
    pub local_hash_value: String,
    #[serde(default)]
    pub remote_hashes: HashMap<HashType, String>,
}

impl CachedHashes {
    pub fn new(local_hash_type: HashType, local_hash_value: impl Into<String>) -> Self {
        Self {
            local_hash_type,
            local_hash_value: local_hash_value.into(),
            remote_hashes: HashMap::new(),
        }
    }

    pub fn with_remote(mut self, hash_type: HashType, value: impl Into<String>) -> Self {
        self.remote_hashes.insert(hash_type, value.into());
        self
    }
}

/// Cache contents of one dataset, keyed by node id.
pub type HashCache = HashMap<String, CachedHashes>;

/// Store-backed access to the cache.
#[derive(Clone)]
pub struct KnownHashes {
    store: Arc<dyn KeyValueStore>,
}

impl KnownHashes {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Load the cache of a dataset. Missing means empty.
    ///
    /// # Errors
    /// - `Serialization` if the stored value is not a cache
    pub async fn get(&self, dataset: &DatasetId) -> Result<HashCache> {
        match self.store.get(&keys::hashes(dataset.as_str())).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(HashCache::new()),
        }
    }

    /// Replace the cache of a dataset. Written without expiry.
    pub async fn put(&self, dataset: &DatasetId, cache: &HashCache) -> Result<()> {
        let raw = serde_json::to_string(cache)?;
        self.store
            .set(&keys::hashes(dataset.as_str()), &raw, None)
            .await?;
        debug!("Stored {} known hashes for {}", cache.len(), dataset);
        Ok(())
    }

    /// Drop the whole cache of a dataset.
    pub async fn invalidate(&self, dataset: &DatasetId) -> Result<()> {
        self.store.delete(&keys::hashes(dataset.as_str())).await
    }

    /// Drop the cache if any destination file changed behind our back.
    ///
    /// An entry is stale when the destination still has the file but its
    /// checksum, or the algorithm of that checksum, is no longer the one the
    /// entry was computed against.
    /// Entries for files the destination no longer has are ignored.
    ///
    /// # Postconditions
    /// - Returns `true` if the cache was invalidated
    pub async fn check(&self, dataset: &DatasetId, destination: &NodeMap) -> Result<bool> {
        let cache = self.get(dataset).await?;
        let stale = cache.iter().find(|(id, cached)| {
            destination.get(*id).is_some_and(|node| {
                node.local_hash != cached.local_hash_value
                    || node.local_hash_type.as_ref() != Some(&cached.local_hash_type)
            })
        });
        match stale {
            Some((id, _)) => {
                info!(
                    "Destination file {} of {} changed outside the engine, dropping known hashes",
                    id, dataset
                );
                self.invalidate(dataset).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
