//! Entry points used by the outer layers: compare, persist, status.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use rdmsync_common::{Credentials, DatasetId, EngineConfig, Result, NEW_DATASET_SUFFIX};
use rdmsync_destination::Destination;
use rdmsync_plugin::{CompareRequest, PluginRegistry, StreamParams};
use rdmsync_store::{keys, KeyValueStore};
use rdmsync_tree::{Action, Node, NodeMap};

use crate::compare::{CachedResponse, CompareEngine, CompareResponse};
use crate::hashes::KnownHashes;
use crate::persist::PersistPipeline;
use crate::queue::{Job, JobQueue};
use crate::services::Services;
use crate::worker::WorkerPool;

/// A user's request to push a selection into a dataset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreRequest {
    pub plugin: String,
    pub stream_params: StreamParams,
    pub persistent_id: String,
    pub credentials: Credentials,
    pub selected_nodes: Vec<Node>,
    pub send_email_on_success: bool,
}

/// What a poller can learn about a dataset's jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetStatus {
    pub dataset: String,
    /// A write job is queued or running.
    pub locked: bool,
    /// Message of the last job that was dropped, while it lasts.
    pub last_error: Option<String>,
    /// Jobs waiting in the shared queue, all datasets.
    pub queued: usize,
}

/// The sync engine.
pub struct SyncEngine {
    services: Services,
    compare: CompareEngine,
    queue: JobQueue,
    pipeline: PersistPipeline,
    hashes: KnownHashes,
    pool: WorkerPool,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        destination: Arc<dyn Destination>,
        plugins: PluginRegistry,
        config: EngineConfig,
    ) -> Result<Self> {
        let services = Services::new(store, destination, Arc::new(plugins), config);
        Ok(Self {
            compare: CompareEngine::new(services.clone())?,
            queue: JobQueue::new(services.store.clone(), services.config.clone()),
            pipeline: PersistPipeline::new(services.clone()),
            hashes: KnownHashes::new(services.store.clone()),
            pool: WorkerPool::new(services.clone()),
            services,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    /// Compare in the foreground, queueing hash jobs if `add_jobs` is set.
    pub async fn compare(
        &self,
        req: &CompareRequest,
        creds: &Credentials,
        add_jobs: bool,
    ) -> Result<CompareResponse> {
        self.compare.compare(req, creds, add_jobs).await
    }

    /// Start a background compare and return its polling key.
    pub async fn start_compare(&self, req: CompareRequest, creds: Credentials) -> Result<String> {
        self.compare.start_compare(req, creds).await
    }

    pub async fn get_compare_result(&self, key: &str) -> Result<CachedResponse> {
        self.compare.get_compare_result(key).await
    }

    /// Build a job from a selection and queue it.
    ///
    /// A placeholder dataset is created at the destination first. Nodes
    /// without an action and work that is already done are dropped; a
    /// selection that ends up empty is accepted without queueing anything.
    ///
    /// # Errors
    /// - `PermissionDenied` if the user may not edit the dataset
    /// - `JobInProgress` if a job for the dataset is already in flight
    pub async fn start_persist(&self, req: StoreRequest) -> Result<Job> {
        let destination = &self.services.destination;
        let mut dataset = DatasetId::new(req.persistent_id.clone())?;
        if dataset.is_placeholder() {
            let collection = req
                .persistent_id
                .trim_end_matches(NEW_DATASET_SUFFIX)
                .trim();
            dataset = destination
                .create_dataset(collection, &req.credentials)
                .await?;
            info!("Created dataset {} in {}", dataset, collection);
        }
        destination
            .check_permission(&dataset, &req.credentials)
            .await?;

        let nodes: NodeMap = req
            .selected_nodes
            .into_iter()
            .filter(|n| n.is_file && n.action != Action::None)
            .map(|n| (n.id.clone(), n))
            .collect();
        let mut stream_params = req.stream_params;
        stream_params.persistent_id = dataset.to_string();
        let mut job = Job::new(
            dataset,
            req.credentials,
            req.plugin,
            stream_params,
            nodes,
        );
        job.send_email_on_success = req.send_email_on_success;

        let known = self.hashes.get(&job.dataset).await?;
        job.writable_nodes = self.pipeline.filter_redundant(&job, &known).await?;
        self.queue.enqueue(&job, true).await?;
        Ok(job)
    }

    /// Start the worker pool.
    pub fn spawn_workers(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        self.pool.spawn(shutdown)
    }

    pub fn workers(&self) -> &WorkerPool {
        &self.pool
    }

    /// Progress markers of the given nodes, by node id.
    ///
    /// Nodes without a live marker are left out.
    pub async fn progress(
        &self,
        dataset: &DatasetId,
        ids: &[String],
    ) -> Result<BTreeMap<String, String>> {
        let mut markers = BTreeMap::new();
        for id in ids {
            let key = keys::progress(dataset.as_str(), id);
            if let Some(value) = self.services.store.get(&key).await? {
                markers.insert(id.clone(), value);
            }
        }
        Ok(markers)
    }

    pub async fn status(&self, dataset: &DatasetId) -> Result<DatasetStatus> {
        Ok(DatasetStatus {
            dataset: dataset.to_string(),
            locked: self.queue.is_locked(dataset).await?,
            last_error: self
                .services
                .store
                .get(&keys::job_error(dataset.as_str()))
                .await?,
            queued: self.queue.len().await?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::OverallStatus;
    use crate::testing::{test_config, DATASET};
    use rdmsync_common::hash::hash_bytes;
    use rdmsync_common::{Error, HashType};
    use rdmsync_destination::MemoryDestination;
    use rdmsync_plugin::MemoryPlugin;
    use rdmsync_store::MemoryStore;
    use std::time::Duration;

    struct Fixture {
        engine: SyncEngine,
        destination: MemoryDestination,
        plugin: MemoryPlugin,
    }

    fn fixture() -> Fixture {
        let destination = MemoryDestination::new();
        let plugin = MemoryPlugin::new("memory");
        let mut plugins = PluginRegistry::new();
        plugins.register(Arc::new(plugin.clone())).unwrap();
        let engine = SyncEngine::new(
            Arc::new(MemoryStore::new()),
            Arc::new(destination.clone()),
            plugins,
            EngineConfig {
                literal_new_status: false,
                ..test_config()
            },
        )
        .unwrap();
        Fixture {
            engine,
            destination,
            plugin,
        }
    }

    fn creds() -> Credentials {
        Credentials::new("alice", "secret-token")
    }

    fn compare_request(dataset: &str) -> CompareRequest {
        CompareRequest {
            plugin: "memory".into(),
            persistent_id: dataset.into(),
            url: "memory://memory".into(),
            ..CompareRequest::default()
        }
    }

    fn selection(nodes: &[Node], action: Action) -> Vec<Node> {
        nodes
            .iter()
            .filter(|n| n.is_file && n.status != rdmsync_tree::Status::Equal)
            .map(|n| n.clone().with_action(action))
            .collect()
    }

    async fn drain(engine: &SyncEngine) {
        let shutdown = CancellationToken::new();
        while engine.workers().process_next(&shutdown).await.unwrap() {}
    }

    #[tokio::test]
    async fn test_compare_persist_compare() {
        let f = fixture();
        f.plugin.put("docs/a.txt", b"alpha", HashType::Md5).unwrap();
        f.plugin.put("b.txt", b"beta", HashType::Md5).unwrap();

        let before = f
            .engine
            .compare(&compare_request(DATASET), &creds(), false)
            .await
            .unwrap();
        assert_eq!(before.status, OverallStatus::New);
        assert_eq!(before.data.len(), 2);

        let job = f
            .engine
            .start_persist(StoreRequest {
                plugin: "memory".into(),
                persistent_id: DATASET.into(),
                credentials: creds(),
                selected_nodes: selection(&before.data, Action::Copy),
                ..StoreRequest::default()
            })
            .await
            .unwrap();
        assert_eq!(job.writable_nodes.len(), 2);

        let during = f
            .engine
            .compare(&compare_request(DATASET), &creds(), false)
            .await
            .unwrap();
        assert_eq!(during.status, OverallStatus::Updating);

        drain(&f.engine).await;
        let after = f
            .engine
            .compare(&compare_request(DATASET), &creds(), false)
            .await
            .unwrap();
        assert_eq!(after.status, OverallStatus::Finished);
        assert_eq!(
            f.destination.file_bytes(DATASET, "docs/a.txt").unwrap(),
            b"alpha"
        );

        let dataset = DatasetId::new(DATASET).unwrap();
        let progress = f
            .engine
            .progress(&dataset, &["b.txt".to_string(), "c.txt".to_string()])
            .await
            .unwrap();
        assert_eq!(progress.get("b.txt").map(String::as_str), Some(keys::WRITTEN));
        assert!(!progress.contains_key("c.txt"));
    }

    #[tokio::test]
    async fn test_second_persist_is_refused_until_done() {
        let f = fixture();
        f.plugin.put("a.txt", b"alpha", HashType::Sha1).unwrap();
        let node = Node::file("a.txt")
            .with_remote(hash_bytes(&HashType::Sha1, b"alpha").unwrap(), HashType::Sha1, 5)
            .with_action(Action::Copy);
        let request = StoreRequest {
            plugin: "memory".into(),
            persistent_id: DATASET.into(),
            credentials: creds(),
            selected_nodes: vec![node],
            ..StoreRequest::default()
        };

        f.engine.start_persist(request.clone()).await.unwrap();
        let err = f.engine.start_persist(request).await.unwrap_err();
        assert!(matches!(err, Error::JobInProgress(_)));
        assert!(err.to_string().contains("already in progress"));

        drain(&f.engine).await;
        let status = f
            .engine
            .status(&DatasetId::new(DATASET).unwrap())
            .await
            .unwrap();
        assert!(!status.locked);
        assert_eq!(status.queued, 0);
        assert_eq!(status.last_error, None);

        // Re-selecting the stored file finds nothing left to do.
        let response = f
            .engine
            .compare(&compare_request(DATASET), &creds(), false)
            .await
            .unwrap();
        assert_eq!(response.status, OverallStatus::Finished);
        let again: Vec<Node> = response
            .data
            .into_iter()
            .map(|n| n.with_action(Action::Copy))
            .collect();
        let job = f
            .engine
            .start_persist(StoreRequest {
                plugin: "memory".into(),
                persistent_id: DATASET.into(),
                credentials: creds(),
                selected_nodes: again,
                ..StoreRequest::default()
            })
            .await
            .unwrap();
        assert!(job.writable_nodes.is_empty());
        assert!(!f.engine.status(&job.dataset).await.unwrap().locked);
    }

    #[tokio::test]
    async fn test_placeholder_dataset_is_created() {
        let f = fixture();
        f.plugin.put("a.txt", b"alpha", HashType::Md5).unwrap();
        let placeholder = format!("root {}", NEW_DATASET_SUFFIX);

        let response = f
            .engine
            .compare(&compare_request(&placeholder), &creds(), true)
            .await
            .unwrap();
        assert_eq!(f.destination.stats().listings, 0);

        let job = f
            .engine
            .start_persist(StoreRequest {
                plugin: "memory".into(),
                persistent_id: placeholder,
                credentials: creds(),
                selected_nodes: selection(&response.data, Action::Copy),
                ..StoreRequest::default()
            })
            .await
            .unwrap();
        assert!(!job.dataset.is_placeholder());
        assert_eq!(job.stream_params.persistent_id, job.dataset.to_string());

        drain(&f.engine).await;
        assert_eq!(
            f.destination.file_ids(job.dataset.as_str()),
            vec!["a.txt".to_string()]
        );
    }

    #[tokio::test]
    async fn test_denied_user_cannot_persist() {
        let f = fixture();
        f.destination.deny("alice").unwrap();
        let err = f
            .engine
            .start_persist(StoreRequest {
                plugin: "memory".into(),
                persistent_id: DATASET.into(),
                credentials: creds(),
                selected_nodes: vec![Node::file("a.txt").with_action(Action::Copy)],
                ..StoreRequest::default()
            })
            .await
            .unwrap_err();
        assert!(err.is_permission());
        let status = f
            .engine
            .status(&DatasetId::new(DATASET).unwrap())
            .await
            .unwrap();
        assert!(!status.locked);
    }

    #[tokio::test]
    async fn test_background_compare_is_polled_once() {
        let f = fixture();
        f.plugin.put("a.txt", b"alpha", HashType::Md5).unwrap();
        let key = f
            .engine
            .start_compare(compare_request(DATASET), creds())
            .await
            .unwrap();
        assert!(key.starts_with("cached_compare_response: "));

        let mut result = f.engine.get_compare_result(&key).await.unwrap();
        for _ in 0..100 {
            if result.ready {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            result = f.engine.get_compare_result(&key).await.unwrap();
        }
        assert!(result.ready);
        assert_eq!(result.response.unwrap().data.len(), 1);
        assert!(!f.engine.get_compare_result(&key).await.unwrap().ready);
    }

    #[tokio::test]
    async fn test_failed_compare_is_reported_in_result() {
        let f = fixture();
        f.plugin.fail_queries(true);
        let key = f
            .engine
            .start_compare(compare_request(DATASET), creds())
            .await
            .unwrap();

        let mut result = f.engine.get_compare_result(&key).await.unwrap();
        for _ in 0..100 {
            if result.ready {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
            result = f.engine.get_compare_result(&key).await.unwrap();
        }
        assert!(result.response.is_none());
        assert!(result.error.unwrap().contains("source unreachable"));
    }
}
