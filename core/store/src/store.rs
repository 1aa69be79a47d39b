//! Shared key-value store trait definition.

use async_trait::async_trait;
use std::time::Duration;

use rdmsync_common::Result;

/// Store shared by every worker and every request handler.
///
/// Every operation is atomic on a single key. Nothing here needs
/// multi-key transactions: the dataset lock serializes per-dataset writers.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Get a value, `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a value, replacing any previous one.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Set a value only if the key is absent or expired.
    ///
    /// # Postconditions
    /// - Returns `true` if this call created the key
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;

    /// Delete a key. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Check if a key is present.
    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Insert at the head of a list.
    async fn push(&self, list: &str, value: &str) -> Result<()>;

    /// Remove from the tail of a list. Together with [`push`](Self::push)
    /// this gives FIFO order.
    async fn pop(&self, list: &str) -> Result<Option<String>>;

    /// Number of entries in a list.
    async fn len(&self, list: &str) -> Result<usize>;
}
