//! Compare: annotate a merged tree with per-node status.
//!
//! The destination and the source rarely agree on a hash algorithm. For
//! every file the engine looks for a destination-side value in the source's
//! algorithm, in this order:
//!
//! 1. the KnownHashes cache entry for the file
//! 2. the destination hash itself, when both sides use the same algorithm
//! 3. the progress marker a running job left for the file
//!
//! Files with no value at all are reported `Unknown` and handed to a
//! hash-only job; the next compare finds the value in the cache.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use rdmsync_common::{Credentials, DatasetId, Result, PENDING};
use rdmsync_plugin::CompareRequest;
use rdmsync_store::keys;
use rdmsync_tree::{build_folders, merge, sorted, Node, NodeMap, Status};

use crate::hashes::{CachedHashes, KnownHashes};
use crate::policy::Policy;
use crate::queue::{Job, JobQueue};
use crate::services::Services;

/// Dataset-level outcome of a compare.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverallStatus {
    /// Some node needs action.
    New = 0,
    /// Jobs are still running or hashes are being computed.
    Updating = 1,
    Finished = 2,
}

impl Serialize for OverallStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for OverallStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            0 => Ok(OverallStatus::New),
            1 => Ok(OverallStatus::Updating),
            2 => Ok(OverallStatus::Finished),
            other => Err(serde::de::Error::custom(format!(
                "unknown compare status {}",
                other
            ))),
        }
    }
}

/// Annotated tree returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareResponse {
    pub id: String,
    pub status: OverallStatus,
    /// File nodes, ordered by id.
    pub data: Vec<Node>,
    /// Folders derived from the file paths.
    pub folders: Vec<Node>,
    pub url: String,
    pub max_file_size: u64,
    pub rejected_size: Vec<String>,
    pub rejected_name: Vec<String>,
    pub allowed_file_name_pattern: String,
    pub allowed_folder_path_pattern: String,
}

/// Poll result of an asynchronous compare.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedResponse {
    pub key: String,
    pub ready: bool,
    #[serde(default)]
    pub response: Option<CompareResponse>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Outcome of [`CompareEngine::annotate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub status: OverallStatus,
    /// Files whose equivalent hash is being computed.
    pub pending: usize,
}

/// Resolve the destination-side hash of `node` in the source's algorithm.
///
/// On return `local_hash`/`local_hash_type` are comparable with the remote
/// side. Returns `true` when no value exists yet and the file needs a
/// rehash; `local_hash` is then [`PENDING`].
pub fn reconcile(node: &mut Node, cached: Option<&CachedHashes>, marker: Option<&str>) -> bool {
    let Some(remote_type) = node.remote_hash_type.clone() else {
        return false;
    };
    if node.local_hash_type.as_ref() == Some(&remote_type) {
        return false;
    }

    let mut value = cached.and_then(|c| c.remote_hashes.get(&remote_type).cloned());
    if value.is_none() {
        value = match marker {
            Some(keys::WRITTEN) => Some(node.remote_hash.clone()),
            Some(keys::DELETED) => Some(String::new()),
            _ => None,
        };
    }

    let pending = value.is_none() && !node.local_hash.is_empty();
    node.local_hash = match value {
        Some(v) => v,
        None if pending => PENDING.to_string(),
        None => String::new(),
    };
    node.local_hash_type = Some(remote_type);
    pending
}

/// Status of a reconciled node.
pub fn node_status(node: &Node) -> Status {
    if node.remote_hash.is_empty() {
        Status::Deleted
    } else if node.local_hash.is_empty() {
        Status::New
    } else if node.local_hash == PENDING {
        Status::Unknown
    } else if node.local_hash != node.remote_hash {
        Status::Updated
    } else {
        Status::Equal
    }
}

/// Runs compares and keeps the KnownHashes cache warm.
#[derive(Clone)]
pub struct CompareEngine {
    services: Services,
    hashes: KnownHashes,
    queue: JobQueue,
    policy: Arc<Policy>,
}

impl CompareEngine {
    pub fn new(services: Services) -> Result<Self> {
        let policy = Policy::new(services.config.max_file_size)?;
        Ok(Self {
            hashes: KnownHashes::new(services.store.clone()),
            queue: JobQueue::new(services.store.clone(), services.config.clone()),
            policy: Arc::new(policy),
            services,
        })
    }

    /// Reconcile every file of a merged tree and derive the overall status.
    ///
    /// Files with no resolvable hash are collected into one hash-only job,
    /// enqueued only when `add_jobs` is set and the credentials carry a token.
    /// The job takes the dataset lock, so while it runs further compares
    /// report `Updating` and queue nothing.
    pub async fn annotate(
        &self,
        nodes: &mut NodeMap,
        dataset: &DatasetId,
        creds: &Credentials,
        add_jobs: bool,
    ) -> Result<Annotation> {
        let known = self.hashes.get(dataset).await?;
        let mut rehash = NodeMap::new();
        let mut had_local = false;

        for (id, node) in nodes.iter_mut().filter(|(_, n)| n.is_file) {
            had_local |= !node.local_hash.is_empty();
            let needs_lookup = node.remote_hash_type.as_ref().is_some_and(|t| {
                node.local_hash_type.as_ref() != Some(t)
                    && !known.get(id).is_some_and(|c| c.remote_hashes.contains_key(t))
            });
            let marker = if needs_lookup {
                self.services
                    .store
                    .get(&keys::progress(dataset.as_str(), id))
                    .await?
            } else {
                None
            };

            let pending = reconcile(node, known.get(id), marker.as_deref());
            node.status = node_status(node);
            // The rehash reads the destination copy, so its size seeds git-hash.
            let computable = node
                .remote_hash_type
                .as_ref()
                .is_some_and(|t| t.is_verifiable(node.metadata.file_size));
            if pending && computable {
                rehash.insert(id.clone(), node.clone());
            }
        }

        let pending = rehash.len();
        if pending > 0 {
            info!("{} files of {} need their hashes computed", pending, dataset);
            if add_jobs && creds.has_token() && !dataset.is_placeholder() {
                let job = Job::hash_only(dataset.clone(), creds.clone(), rehash);
                if let Err(e) = self.queue.enqueue(&job, true).await {
                    warn!("Could not queue hash job for {}: {}", dataset, e);
                }
            }
        }

        let locked = self.queue.is_locked(dataset).await?;
        let needs_action = nodes
            .values()
            .any(|n| n.is_file && n.status != Status::Equal);
        let is_new = if self.services.config.literal_new_status {
            had_local
        } else {
            needs_action
        };
        let status = if pending > 0 || locked {
            OverallStatus::Updating
        } else if is_new {
            OverallStatus::New
        } else {
            OverallStatus::Finished
        };
        Ok(Annotation { status, pending })
    }

    /// Full compare of a source selection against its dataset.
    ///
    /// # Errors
    /// - `PermissionDenied` if the user may not edit the dataset
    /// - whatever the plugin's `query` fails with
    pub async fn compare(
        &self,
        req: &CompareRequest,
        creds: &Credentials,
        add_jobs: bool,
    ) -> Result<CompareResponse> {
        let dataset = DatasetId::new(req.persistent_id.clone())?;
        let destination = &self.services.destination;

        let destination_nodes = if dataset.is_placeholder() {
            NodeMap::new()
        } else {
            destination.check_permission(&dataset, creds).await?;
            let nodes = destination.list_files(&dataset, creds).await?;
            self.hashes.check(&dataset, &nodes).await?;
            nodes
        };

        let plugin = self.services.plugins.get(&req.plugin);
        let mut remote = plugin.query(req, &destination_nodes).await?;
        let rejections = self.policy.apply(&mut remote);
        debug!(
            "{} listed {} files, {} destination files",
            plugin.id(),
            remote.len(),
            destination_nodes.len()
        );

        let mut merged = merge(&destination_nodes, &remote);
        let annotation = self.annotate(&mut merged, &dataset, creds, add_jobs).await?;

        Ok(CompareResponse {
            id: dataset.to_string(),
            status: annotation.status,
            folders: build_folders(&merged),
            data: sorted(&merged),
            url: req.url.clone(),
            max_file_size: self.policy.max_file_size(),
            rejected_size: rejections.size,
            rejected_name: rejections.name,
            allowed_file_name_pattern: self.policy.file_name_rule().to_string(),
            allowed_folder_path_pattern: self.policy.folder_path_rule().to_string(),
        })
    }

    /// Run a compare in the background.
    ///
    /// Returns the key to poll with [`get_compare_result`](Self::get_compare_result).
    pub async fn start_compare(&self, req: CompareRequest, creds: Credentials) -> Result<String> {
        let key = format!("cached_compare_response: {}", Uuid::new_v4());
        let engine = self.clone();
        let task_key = key.clone();
        tokio::spawn(async move {
            let deadline = engine.services.config.job_deadline;
            let outcome = tokio::time::timeout(deadline, engine.compare(&req, &creds, true)).await;
            let cached = match outcome {
                Ok(Ok(response)) => CachedResponse {
                    key: task_key.clone(),
                    ready: true,
                    response: Some(response),
                    error: None,
                },
                Ok(Err(e)) => {
                    warn!("Compare of {} failed: {}", req.persistent_id, e);
                    failed_response(&task_key, e.to_string())
                }
                Err(_) => failed_response(&task_key, format!("compare timed out after {:?}", deadline)),
            };
            if let Err(e) = engine.store_result(&cached, engine.services.config.compare_ttl).await {
                warn!("Could not store compare result {}: {}", task_key, e);
            }
        });
        Ok(key)
    }

    /// Poll an asynchronous compare.
    ///
    /// A finished result is handed out once and then removed.
    pub async fn get_compare_result(&self, key: &str) -> Result<CachedResponse> {
        let store = &self.services.store;
        let Some(raw) = store.get(key).await? else {
            return Ok(CachedResponse {
                key: key.to_string(),
                ..CachedResponse::default()
            });
        };
        let cached: CachedResponse = serde_json::from_str(&raw)?;
        store.delete(key).await?;
        Ok(cached)
    }

    async fn store_result(&self, cached: &CachedResponse, ttl: Duration) -> Result<()> {
        let raw = serde_json::to_string(cached)?;
        self.services.store.set(&cached.key, &raw, Some(ttl)).await
    }
}

fn failed_response(key: &str, error: String) -> CachedResponse {
    CachedResponse {
        key: key.to_string(),
        ready: true,
        response: None,
        error: Some(error),
    }
}
