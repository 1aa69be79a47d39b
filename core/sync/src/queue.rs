//! Persist jobs and the shared FIFO queue they travel through.
//!
//! Jobs are serialized into the store's `jobs` list. A write job may only
//! enter the queue while it holds its dataset's lock; the lock is taken on
//! first submission and merely checked on re-queues.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use rdmsync_common::{Credentials, DatasetId, EngineConfig, Error, Result};
use rdmsync_plugin::StreamParams;
use rdmsync_store::{keys, KeyValueStore};
use rdmsync_tree::NodeMap;

/// Plugin name of jobs that only compute missing hash equivalences.
pub const HASH_ONLY: &str = "hash-only";

/// A unit of persist work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub dataset: DatasetId,
    pub credentials: Credentials,
    /// Plugin the streams come from, or [`HASH_ONLY`].
    pub plugin: String,
    pub stream_params: StreamParams,
    /// Nodes still to process. Shrinks as nodes complete.
    pub writable_nodes: NodeMap,
    /// Failed attempts so far.
    #[serde(default)]
    pub retries: u32,
    /// Set when a worker picks the job up.
    #[serde(default)]
    pub deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub send_email_on_success: bool,
}

impl Job {
    pub fn new(
        dataset: DatasetId,
        credentials: Credentials,
        plugin: impl Into<String>,
        stream_params: StreamParams,
        writable_nodes: NodeMap,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            dataset,
            credentials,
            plugin: plugin.into(),
            stream_params,
            writable_nodes,
            retries: 0,
            deadline: None,
            send_email_on_success: false,
        }
    }

    /// A job that downloads destination files to fill the hash cache.
    pub fn hash_only(dataset: DatasetId, credentials: Credentials, nodes: NodeMap) -> Self {
        let params = StreamParams {
            persistent_id: dataset.to_string(),
            ..StreamParams::default()
        };
        Self::new(dataset, credentials, HASH_ONLY, params, nodes)
    }

    pub fn is_hash_only(&self) -> bool {
        self.plugin == HASH_ONLY
    }
}

/// Store-backed job queue with per-dataset locking.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn KeyValueStore>,
    config: Arc<EngineConfig>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn KeyValueStore>, config: Arc<EngineConfig>) -> Self {
        Self { store, config }
    }

    /// Put a job at the head of the queue.
    ///
    /// # Preconditions
    /// - On re-queue (`first_submission == false`) the caller holds the lock
    ///
    /// # Postconditions
    /// - A job with no writable nodes is accepted and dropped
    /// - A first-submitted job holds its dataset lock
    ///
    /// # Errors
    /// - `JobInProgress` if another job holds the lock
    /// - `InvalidInput` if a re-queued job's lock is gone
    pub async fn enqueue(&self, job: &Job, first_submission: bool) -> Result<()> {
        if job.writable_nodes.is_empty() {
            debug!("Job {} for {} has nothing to do", job.id, job.dataset);
            return Ok(());
        }
        if job.dataset.as_str().trim().is_empty() {
            return Err(Error::InvalidInput("job without dataset id".to_string()));
        }

        let lock_key = keys::lock(job.dataset.as_str());
        let mut locked_here = false;
        if first_submission {
            let acquired = self
                .store
                .set_nx(&lock_key, &job.id, Some(self.config.lock_ttl))
                .await?;
            if !acquired {
                return Err(Error::JobInProgress(job.dataset.to_string()));
            }
            locked_here = true;
        } else if !self.store.exists(&lock_key).await? {
            return Err(Error::InvalidInput(format!(
                "lock for {} expired while job {} was pending",
                job.dataset, job.id
            )));
        }

        let payload = serde_json::to_string(job)?;
        if let Err(e) = self.store.push(keys::JOBS, &payload).await {
            if locked_here {
                self.unlock(&job.dataset).await?;
            }
            return Err(e);
        }
        info!(
            "Queued job {} for {} ({} nodes, attempt {})",
            job.id,
            job.dataset,
            job.writable_nodes.len(),
            job.retries + 1
        );
        Ok(())
    }

    /// Take the oldest job, if any.
    ///
    /// An unreadable entry is discarded and reported as an error.
    pub async fn dequeue(&self) -> Result<Option<Job>> {
        let Some(payload) = self.store.pop(keys::JOBS).await? else {
            return Ok(None);
        };
        match serde_json::from_str::<Job>(&payload) {
            Ok(job) => Ok(Some(job)),
            Err(e) => {
                warn!("Discarding unreadable job entry: {}", e);
                Err(e.into())
            }
        }
    }

    pub async fn is_locked(&self, dataset: &DatasetId) -> Result<bool> {
        self.store.exists(&keys::lock(dataset.as_str())).await
    }

    /// Release a dataset lock.
    pub async fn unlock(&self, dataset: &DatasetId) -> Result<()> {
        self.store.delete(&keys::lock(dataset.as_str())).await?;
        debug!("Released lock on {}", dataset);
        Ok(())
    }

    /// Number of queued jobs.
    pub async fn len(&self) -> Result<usize> {
        self.store.len(keys::JOBS).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdmsync_store::MemoryStore;
    use rdmsync_tree::{Action, Node};

    fn queue() -> (JobQueue, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let queue = JobQueue::new(store.clone(), Arc::new(EngineConfig::default()));
        (queue, store)
    }

    fn job(dataset: &str, ids: &[&str]) -> Job {
        let nodes = ids
            .iter()
            .map(|id| (id.to_string(), Node::file(*id).with_action(Action::Copy)))
            .collect();
        Job::new(
            DatasetId::new(dataset).unwrap(),
            Credentials::new("alice", "token"),
            "memory",
            StreamParams::default(),
            nodes,
        )
    }

    #[tokio::test]
    async fn test_second_job_for_same_dataset_is_refused() {
        let (queue, _) = queue();
        queue.enqueue(&job("doi:X", &["a"]), true).await.unwrap();

        let err = queue.enqueue(&job("doi:X", &["b"]), true).await.unwrap_err();
        assert!(matches!(err, Error::JobInProgress(_)));
        assert_eq!(err.to_string(), "job for doi:X is already in progress");

        queue.enqueue(&job("doi:Y", &["b"]), true).await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_empty_job_is_noop() {
        let (queue, _) = queue();
        queue.enqueue(&job("doi:X", &[]), true).await.unwrap();
        assert!(queue.is_empty().await.unwrap());
        assert!(!queue.is_locked(&DatasetId::new("doi:X").unwrap()).await.unwrap());
    }

    #[tokio::test]
    async fn test_fifo_roundtrip() {
        let (queue, _) = queue();
        let first = job("doi:X", &["a"]);
        let second = job("doi:Y", &["b"]);
        queue.enqueue(&first, true).await.unwrap();
        queue.enqueue(&second, true).await.unwrap();

        assert_eq!(queue.dequeue().await.unwrap(), Some(first));
        assert_eq!(queue.dequeue().await.unwrap(), Some(second));
        assert_eq!(queue.dequeue().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_requeue_needs_existing_lock() {
        let (queue, _) = queue();
        let mut j = job("doi:X", &["a"]);
        queue.enqueue(&j, true).await.unwrap();
        let _ = queue.dequeue().await.unwrap();

        j.retries = 1;
        queue.enqueue(&j, false).await.unwrap();
        let _ = queue.dequeue().await.unwrap();

        queue.unlock(&j.dataset).await.unwrap();
        let err = queue.enqueue(&j, false).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_hash_only_jobs_share_the_lock() {
        let (queue, _) = queue();
        let mut nodes = NodeMap::new();
        nodes.insert("a".into(), Node::file("a"));
        let rehash = Job::hash_only(
            DatasetId::new("doi:X").unwrap(),
            Credentials::new("alice", "token"),
            nodes,
        );
        queue.enqueue(&rehash, true).await.unwrap();
        assert!(queue.is_locked(&rehash.dataset).await.unwrap());

        let err = queue.enqueue(&job("doi:X", &["a"]), true).await.unwrap_err();
        assert!(matches!(err, Error::JobInProgress(_)));
        let err = queue.enqueue(&rehash, true).await.unwrap_err();
        assert!(matches!(err, Error::JobInProgress(_)));
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_garbage_entry_is_discarded() {
        let (queue, store) = queue();
        store.push(keys::JOBS, "not json").await.unwrap();
        assert!(queue.dequeue().await.is_err());
        assert_eq!(queue.dequeue().await.unwrap(), None);
    }
}
