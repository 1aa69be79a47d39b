//! Fixtures shared by the unit tests of this crate.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rdmsync_common::hash::hash_bytes;
use rdmsync_common::{Credentials, DatasetId, EngineConfig, HashType, Result};
use rdmsync_destination::{Destination, MemoryDestination};
use rdmsync_plugin::{MemoryPlugin, Plugin, PluginRegistry, StreamParams};
use rdmsync_store::{KeyValueStore, MemoryStore};
use rdmsync_tree::{Action, Node, NodeMap};

use crate::hashes::{HashCache, KnownHashes};
use crate::queue::Job;
use crate::services::Services;

pub(crate) const DATASET: &str = "doi:10.5072/FK2/ABC";

/// Memory store that counts lock releases and hash cache writes.
#[derive(Default)]
pub(crate) struct CountingStore {
    inner: MemoryStore,
    lock_releases: AtomicUsize,
    hash_writes: AtomicUsize,
}

impl CountingStore {
    pub(crate) fn lock_releases(&self) -> usize {
        self.lock_releases.load(Ordering::SeqCst)
    }

    pub(crate) fn hash_writes(&self) -> usize {
        self.hash_writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KeyValueStore for CountingStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        if key.starts_with("hashes: ") {
            self.hash_writes.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.set(key, value, ttl).await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        self.inner.set_nx(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        if key.starts_with("lock: ") {
            self.lock_releases.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.delete(key).await
    }

    async fn push(&self, list: &str, value: &str) -> Result<()> {
        self.inner.push(list, value).await
    }

    async fn pop(&self, list: &str) -> Result<Option<String>> {
        self.inner.pop(list).await
    }

    async fn len(&self, list: &str) -> Result<usize> {
        self.inner.len(list).await
    }
}

pub(crate) fn test_config() -> EngineConfig {
    EngineConfig {
        workers: 2,
        poll_interval: Duration::from_millis(5),
        registration_poll_delay: Duration::from_millis(1),
        retry_backoff_cap: Duration::from_millis(5),
        ..EngineConfig::default()
    }
}

pub(crate) struct Harness {
    pub services: Services,
    pub store: Arc<CountingStore>,
    pub destination: MemoryDestination,
    pub plugin: MemoryPlugin,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(MemoryDestination::new(), MemoryPlugin::new("memory"))
    }

    pub fn with(destination: MemoryDestination, plugin: MemoryPlugin) -> Self {
        Self::with_config(destination, plugin, test_config())
    }

    pub fn with_config(
        destination: MemoryDestination,
        plugin: MemoryPlugin,
        config: EngineConfig,
    ) -> Self {
        let store = Arc::new(CountingStore::default());
        let mut plugins = PluginRegistry::new();
        plugins
            .register(Arc::new(plugin.clone()))
            .expect("fresh registry");
        let services = Services::new(
            store.clone(),
            Arc::new(destination.clone()),
            Arc::new(plugins),
            config,
        );
        Self {
            services,
            store,
            destination,
            plugin,
        }
    }

    pub fn dataset() -> DatasetId {
        DatasetId::new(DATASET).expect("valid id")
    }

    pub fn creds() -> Credentials {
        Credentials::new("alice", "secret-token")
    }

    pub fn node_map(&self, nodes: Vec<Node>) -> NodeMap {
        nodes.into_iter().map(|n| (n.id.clone(), n)).collect()
    }

    /// A write job from the memory plugin.
    pub fn job(&self, nodes: Vec<Node>) -> Job {
        let params = StreamParams {
            persistent_id: DATASET.to_string(),
            ..StreamParams::default()
        };
        Job::new(
            Self::dataset(),
            Self::creds(),
            self.plugin.id(),
            params,
            self.node_map(nodes),
        )
    }

    /// Put a file into the source and return its node as a compare would.
    pub fn source_file(&self, id: &str, data: &[u8], hash_type: HashType, action: Action) -> Node {
        self.plugin
            .put(id, data, hash_type.clone())
            .expect("source put");
        let hash = hash_bytes(&hash_type, data).expect("computable");
        Node::file(id)
            .with_remote(hash, hash_type, data.len() as u64)
            .with_action(action)
    }

    /// The destination's current node for `id`.
    pub async fn listed(&self, id: &str) -> Node {
        self.destination
            .list_files(&Self::dataset(), &Self::creds())
            .await
            .expect("listing")
            .remove(id)
            .expect("listed node")
    }

    pub fn hashes(&self) -> KnownHashes {
        KnownHashes::new(self.store.clone())
    }

    pub async fn known(&self) -> HashCache {
        self.hashes().get(&Self::dataset()).await.expect("cache")
    }
}
