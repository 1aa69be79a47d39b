//! In-memory plugin for testing.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rdmsync_common::hash::hash_bytes;
use rdmsync_common::stream::bytes_stream;
use rdmsync_common::{ByteStream, Error, HashType, Result};
use rdmsync_tree::{Node, NodeMap};

use crate::plugin::{Cleanup, CompareRequest, NodeStream, Plugin, StreamParams, StreamSet};

#[derive(Debug, Clone)]
struct SourceFile {
    data: Vec<u8>,
    hash_type: HashType,
    hash: String,
}

#[derive(Default)]
struct Faults {
    failing_opens: AtomicU32,
    fail_query: AtomicBool,
    opens: AtomicU32,
    open_delay_ms: AtomicU32,
    omit_sizes: AtomicBool,
}

/// Scripted source backend.
///
/// Files are declared up front; faults can be injected to exercise retries
/// and cancellation. Clones share the same contents.
#[derive(Clone)]
pub struct MemoryPlugin {
    id: String,
    files: Arc<RwLock<HashMap<String, SourceFile>>>,
    faults: Arc<Faults>,
    deferred_task: Option<String>,
}

impl MemoryPlugin {
    /// Create a new empty plugin registered under `id`.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            files: Arc::new(RwLock::new(HashMap::new())),
            faults: Arc::new(Faults::default()),
            deferred_task: None,
        }
    }

    /// Serve no per-node streams; a cleanup reports `task_id` instead.
    pub fn with_deferred_transfer(mut self, task_id: impl Into<String>) -> Self {
        self.deferred_task = Some(task_id.into());
        self
    }

    /// Add a file; its declared hash is computed from `data`.
    pub fn put(&self, id: &str, data: &[u8], hash_type: HashType) -> Result<()> {
        let hash = hash_bytes(&hash_type, data)?;
        self.put_declared(id, data, hash_type, hash)
    }

    /// Add a file with an explicit declared hash.
    pub fn put_declared(
        &self,
        id: &str,
        data: &[u8],
        hash_type: HashType,
        hash: impl Into<String>,
    ) -> Result<()> {
        let mut files = self.files.write().map_err(|_| poisoned())?;
        files.insert(
            id.to_string(),
            SourceFile {
                data: data.to_vec(),
                hash_type,
                hash: hash.into(),
            },
        );
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<()> {
        self.files.write().map_err(|_| poisoned())?.remove(id);
        Ok(())
    }

    /// The next `n` stream opens fail with a network error.
    pub fn fail_next_opens(&self, n: u32) {
        self.faults.failing_opens.store(n, Ordering::SeqCst);
    }

    pub fn fail_queries(&self, fail: bool) {
        self.faults.fail_query.store(fail, Ordering::SeqCst);
    }

    /// List every file with size 0, as sources without size metadata do.
    pub fn omit_sizes(&self, omit: bool) {
        self.faults.omit_sizes.store(omit, Ordering::SeqCst);
    }

    /// Delay every stream open.
    pub fn set_open_delay(&self, delay: Duration) {
        self.faults
            .open_delay_ms
            .store(delay.as_millis() as u32, Ordering::SeqCst);
    }

    /// Number of successful stream opens so far.
    pub fn opens(&self) -> u32 {
        self.faults.opens.load(Ordering::SeqCst)
    }
}

fn poisoned() -> Error {
    Error::InvalidInput("memory plugin lock poisoned".to_string())
}

#[async_trait]
impl Plugin for MemoryPlugin {
    fn id(&self) -> &str {
        &self.id
    }

    async fn query(&self, _req: &CompareRequest, _destination: &NodeMap) -> Result<NodeMap> {
        if self.faults.fail_query.load(Ordering::SeqCst) {
            return Err(Error::Network(format!("{}: source unreachable", self.id)));
        }
        let omit_sizes = self.faults.omit_sizes.load(Ordering::SeqCst);
        let files = self.files.read().map_err(|_| poisoned())?;
        Ok(files
            .iter()
            .map(|(id, file)| {
                let size = if omit_sizes { 0 } else { file.data.len() as u64 };
                let mut node =
                    Node::file(id.clone()).with_remote(file.hash.clone(), file.hash_type.clone(), size);
                node.url = format!("memory://{}/{}", self.id, id);
                (id.clone(), node)
            })
            .collect())
    }

    async fn streams(&self, nodes: &NodeMap, _params: &StreamParams) -> Result<StreamSet> {
        if let Some(task_id) = &self.deferred_task {
            return Ok(StreamSet {
                streams: HashMap::new(),
                cleanup: Some(Box::new(DeferredTransfer {
                    task_id: task_id.clone(),
                })),
            });
        }

        let files = self.files.read().map_err(|_| poisoned())?;
        let mut set = StreamSet::default();
        for (id, node) in nodes {
            if !node.action.needs_stream() {
                continue;
            }
            let file = files
                .get(id)
                .ok_or_else(|| Error::NotFound(format!("{} is not in source {}", id, self.id)))?;
            set.streams.insert(
                id.clone(),
                Box::new(MemoryStream::new(file.data.clone(), self.faults.clone())),
            );
        }
        Ok(set)
    }
}

struct MemoryStream {
    data: Option<Vec<u8>>,
    faults: Arc<Faults>,
}

impl MemoryStream {
    fn new(data: Vec<u8>, faults: Arc<Faults>) -> Self {
        Self {
            data: Some(data),
            faults,
        }
    }
}

#[async_trait]
impl NodeStream for MemoryStream {
    async fn open(&mut self) -> Result<ByteStream> {
        let delay = self.faults.open_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        }
        let fail = self
            .faults
            .failing_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(Error::Network("injected stream failure".to_string()));
        }
        let data = self
            .data
            .take()
            .ok_or_else(|| Error::InvalidInput("stream already opened".to_string()))?;
        self.faults.opens.fetch_add(1, Ordering::SeqCst);
        Ok(bytes_stream(data))
    }

    async fn close(&mut self) -> Result<()> {
        self.data = None;
        Ok(())
    }
}

struct DeferredTransfer {
    task_id: String,
}

#[async_trait]
impl Cleanup for DeferredTransfer {
    async fn run(&mut self) -> Result<Option<String>> {
        Ok(Some(self.task_id.clone()))
    }
}
