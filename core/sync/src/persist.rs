//! Persist pipeline: carry out one job against the destination.
//!
//! Nodes are processed one at a time in id order. Every byte written is
//! hashed twice on the way through: once in the destination's algorithm to
//! check what got stored, once in the source's algorithm to check what got
//! downloaded. Finished nodes leave `job.writable_nodes`, so an interrupted
//! job resumes where it stopped.

use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rdmsync_common::hash::{hash_stream, hashing_stream};
use rdmsync_common::{DualDigest, DualHasher, Error, HashType, Hasher, Result, NOT_NEEDED};
use rdmsync_destination::Registration;
use rdmsync_plugin::{NodeStream, StreamSet};
use rdmsync_store::keys;
use rdmsync_tree::{Action, Node, NodeMap};

use crate::hashes::{CachedHashes, HashCache, KnownHashes};
use crate::queue::Job;
use crate::retry::{Retry, RetryConfig};
use crate::services::Services;

/// Run `fut` unless `cancel` fires first.
pub(crate) async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled("job interrupted".to_string())),
        result = fut => result,
    }
}

/// A file uploaded to storage and waiting for its registration call.
struct PendingRegistration {
    /// The node as it was in the job, restored on rollback.
    original: Node,
    registered: Node,
    storage_identifier: String,
    checksum: String,
}

#[derive(Default)]
struct Batch {
    add: Vec<PendingRegistration>,
    replace: Vec<PendingRegistration>,
}

impl Batch {
    fn push(&mut self, pending: PendingRegistration) {
        if pending.original.metadata.exists() {
            self.replace.push(pending);
        } else {
            self.add.push(pending);
        }
    }

    fn is_empty(&self) -> bool {
        self.add.is_empty() && self.replace.is_empty()
    }
}

/// Executes jobs. Holds no per-job state and is cheap to clone.
#[derive(Clone)]
pub struct PersistPipeline {
    services: Services,
    hashes: KnownHashes,
}

impl PersistPipeline {
    pub fn new(services: Services) -> Self {
        Self {
            hashes: KnownHashes::new(services.store.clone()),
            services,
        }
    }

    /// Process a job.
    ///
    /// # Postconditions
    /// - `job.writable_nodes` holds exactly the nodes not yet done
    ///
    /// # Errors
    /// - `Cancelled` when `cancel` fires; the remaining nodes stay in the job
    /// - `PermissionDenied` if the user lost edit rights
    /// - `DataIntegrity` on a hash mismatch
    pub async fn run(&self, job: &mut Job, cancel: &CancellationToken) -> Result<()> {
        if job.is_hash_only() {
            return self.rehash(job, cancel).await;
        }

        let mut known = self.hashes.get(&job.dataset).await?;
        job.writable_nodes = self.filter_redundant(job, &known).await?;
        if job.writable_nodes.is_empty() {
            info!("Nothing left to write for {}", job.dataset);
            return Ok(());
        }

        let stream_nodes: NodeMap = job
            .writable_nodes
            .iter()
            .filter(|(_, n)| n.action.needs_stream())
            .map(|(id, n)| (id.clone(), n.clone()))
            .collect();
        let mut streams = if stream_nodes.is_empty() {
            StreamSet::default()
        } else {
            let plugin = self.services.plugins.get(&job.plugin);
            let mut params = job.stream_params.clone();
            params.persistent_id = job.dataset.to_string();
            cancellable(cancel, plugin.streams(&stream_nodes, &params)).await?
        };

        let result = self
            .persist_nodes(job, &mut streams, &mut known, cancel)
            .await;

        for (id, stream) in streams.streams.iter_mut() {
            if let Err(e) = stream.close().await {
                debug!("Closing unused stream of {} failed: {}", id, e);
            }
        }

        let Some(cleanup) = streams.cleanup.as_mut() else {
            return result;
        };
        match result {
            Ok(()) => {
                if let Some(task_id) = cleanup.run().await? {
                    info!("Transfer into {} continues as task {}", job.dataset, task_id);
                }
                Ok(())
            }
            Err(e) => {
                if let Err(cleanup_err) = cleanup.run().await {
                    warn!("Cleanup after failed job {} failed: {}", job.id, cleanup_err);
                }
                Err(e)
            }
        }
    }

    /// Drop nodes whose work is already done.
    ///
    /// A copy or update is redundant when the cache says the destination
    /// holds exactly the declared remote content. A delete is redundant when
    /// a fresh listing no longer has the file.
    pub async fn filter_redundant(&self, job: &Job, known: &HashCache) -> Result<NodeMap> {
        let mut kept = NodeMap::new();
        let mut deletes = Vec::new();
        for (id, node) in &job.writable_nodes {
            match node.action {
                Action::None => {}
                Action::Delete => deletes.push(node),
                Action::Copy | Action::Update => {
                    if is_redundant(node, known.get(id)) {
                        debug!("{} is already up to date in {}", id, job.dataset);
                    } else {
                        kept.insert(id.clone(), node.clone());
                    }
                }
            }
        }

        if !deletes.is_empty() {
            let listing = self
                .services
                .destination
                .list_files(&job.dataset, &job.credentials)
                .await?;
            for node in deletes {
                match listing.get(&node.id) {
                    Some(listed) => {
                        let mut node = node.clone();
                        node.metadata = listed.metadata.clone();
                        kept.insert(node.id.clone(), node);
                    }
                    None => debug!("{} is already gone from {}", node.id, job.dataset),
                }
            }
        }
        Ok(kept)
    }

    async fn persist_nodes(
        &self,
        job: &mut Job,
        streams: &mut StreamSet,
        known: &mut HashCache,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let destination = &self.services.destination;
        cancellable(
            cancel,
            destination.check_permission(&job.dataset, &job.credentials),
        )
        .await?;

        let deferred = streams.is_deferred();
        let flush_every = self.services.config.cache_flush_every.max(1);
        let mut batch = Batch::default();
        let mut ids: Vec<String> = job.writable_nodes.keys().cloned().collect();
        ids.sort();
        let total = ids.len();

        let mut outcome = Ok(());
        for (i, id) in ids.iter().enumerate() {
            if cancel.is_cancelled() {
                outcome = Err(Error::Cancelled(format!("job {} stopped", job.id)));
                break;
            }
            if i > 0 && i % flush_every == 0 {
                self.store_hashes(job, known).await;
                info!("Processed {}/{} files of {}", i, total, job.dataset);
            }

            let Some(node) = job.writable_nodes.get(id).cloned() else {
                continue;
            };
            let step = match node.action {
                Action::Delete => self.delete_node(job, &node, known, cancel).await,
                Action::Copy | Action::Update if deferred => {
                    self.defer_node(job, &node, known, cancel).await
                }
                Action::Copy | Action::Update => {
                    self.write_node(job, &node, streams, known, &mut batch, cancel)
                        .await
                }
                Action::None => {
                    job.writable_nodes.remove(id);
                    Ok(())
                }
            };
            if let Err(e) = step {
                warn!("{} of {} failed: {}", id, job.dataset, e);
                outcome = Err(e);
                break;
            }
        }

        if let Err(e) = self.flush(job, &mut batch, known).await {
            match outcome {
                Ok(()) => outcome = Err(e),
                Err(_) => warn!("Registration after failed node also failed: {}", e),
            }
        }
        let stored = self.hashes.put(&job.dataset, known).await;
        outcome?;
        stored?;

        let capabilities = destination.capabilities();
        if capabilities.direct_upload && capabilities.cleanup_storage {
            if let Err(e) = destination
                .cleanup_storage(&job.dataset, &job.credentials)
                .await
            {
                warn!("Storage cleanup of {} failed: {}", job.dataset, e);
            }
        }
        info!("Persisted {} files of {}", total, job.dataset);
        Ok(())
    }

    async fn delete_node(
        &self,
        job: &mut Job,
        node: &Node,
        known: &mut HashCache,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let file_id = node.metadata.file_id.ok_or_else(|| {
            Error::InvalidInput(format!("{} has no destination file id", node.id))
        })?;
        cancellable(
            cancel,
            self.services
                .destination
                .delete_file(&job.dataset, file_id, &job.credentials),
        )
        .await?;
        known.remove(&node.id);
        job.writable_nodes.remove(&node.id);
        self.set_marker(job, &node.id, keys::DELETED).await
    }

    /// Record a node whose bytes a deferred transfer moves later.
    async fn defer_node(
        &self,
        job: &mut Job,
        node: &Node,
        known: &mut HashCache,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if node.action == Action::Update {
            if let Some(file_id) = node.metadata.file_id {
                cancellable(
                    cancel,
                    self.services
                        .destination
                        .delete_file(&job.dataset, file_id, &job.credentials),
                )
                .await?;
            }
        }
        job.writable_nodes.remove(&node.id);
        known.insert(
            node.id.clone(),
            CachedHashes::new(HashType::LastModified, node.remote_hash.clone())
                .with_remote(HashType::LastModified, node.remote_hash.clone()),
        );
        self.set_marker(job, &node.id, keys::WRITTEN).await
    }

    async fn write_node(
        &self,
        job: &mut Job,
        node: &Node,
        streams: &mut StreamSet,
        known: &mut HashCache,
        batch: &mut Batch,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut stream = streams.streams.remove(&node.id).ok_or_else(|| {
            Error::InvalidInput(format!("plugin '{}' gave no stream for {}", job.plugin, node.id))
        })?;
        let transfer = self.transfer(job, node, stream.as_mut(), cancel).await;
        if let Err(e) = stream.close().await {
            debug!("Closing stream of {} failed: {}", node.id, e);
        }
        let (digest, storage_identifier) = transfer?;
        let remote_value = verify_remote(node, &digest)?;
        let default_hash = &self.services.config.default_hash;

        match storage_identifier {
            Some(storage_identifier) => {
                let mut registered = node.clone();
                registered.metadata.checksum_type = Some(default_hash.clone());
                registered.metadata.checksum_value = Some(digest.destination.clone());
                registered.metadata.file_size = Some(digest.size);
                batch.push(PendingRegistration {
                    original: node.clone(),
                    registered,
                    storage_identifier,
                    checksum: digest.destination.clone(),
                });
            }
            None => {
                let listed = self.await_listing(job, node, cancel).await?;
                verify_stored(&listed, &digest.destination, default_hash)?;
            }
        }

        match (&node.remote_hash_type, remote_value) {
            (Some(remote_type), Some(remote_value)) if remote_value != digest.destination => {
                known.insert(
                    node.id.clone(),
                    CachedHashes::new(default_hash.clone(), digest.destination.clone())
                        .with_remote(remote_type.clone(), remote_value),
                );
            }
            _ => {
                known.remove(&node.id);
            }
        }
        self.set_marker(job, &node.id, keys::WRITTEN).await?;
        job.writable_nodes.remove(&node.id);
        debug!("Wrote {} ({} bytes) to {}", node.id, digest.size, job.dataset);
        Ok(())
    }

    /// Stream one node into the destination.
    ///
    /// Returns the digests and, for direct uploads, the storage identifier
    /// still to be registered.
    async fn transfer(
        &self,
        job: &Job,
        node: &Node,
        stream: &mut dyn NodeStream,
        cancel: &CancellationToken,
    ) -> Result<(DualDigest, Option<String>)> {
        let size = (node.remote_file_size > 0).then_some(node.remote_file_size);
        let hasher = DualHasher::new(
            &self.services.config.default_hash,
            node.remote_hash_type.as_ref(),
            size,
        )?;
        let source = cancellable(cancel, stream.open()).await?;
        let (tapped, digest) = hashing_stream(source, hasher);

        let destination = &self.services.destination;
        let storage_identifier = if destination.capabilities().direct_upload {
            let id = cancellable(
                cancel,
                destination.upload_to_storage(&job.dataset, node, tapped, &job.credentials),
            )
            .await?;
            Some(id)
        } else {
            cancellable(
                cancel,
                destination.add_file_legacy(&job.dataset, node, tapped, &job.credentials),
            )
            .await?;
            None
        };
        Ok((digest.finish()?, storage_identifier))
    }

    /// Poll the listing until a legacy deposit shows up.
    async fn await_listing(
        &self,
        job: &Job,
        node: &Node,
        cancel: &CancellationToken,
    ) -> Result<Node> {
        let config = &self.services.config;
        let retry = Retry::new(RetryConfig::fixed(
            config.registration_poll_attempts,
            config.registration_poll_delay,
        ));
        let destination = &self.services.destination;
        let poll = retry.run_while(
            || async move {
                let files = destination
                    .list_files(&job.dataset, &job.credentials)
                    .await?;
                files
                    .get(&node.id)
                    .cloned()
                    .ok_or_else(|| Error::NotFound(format!("{} not listed yet", node.id)))
            },
            |e| matches!(e, Error::NotFound(_)),
        );
        cancellable(cancel, poll).await
    }

    /// Register the batched uploads, adds first.
    ///
    /// Nodes whose registration failed go back into the job.
    async fn flush(&self, job: &mut Job, batch: &mut Batch, known: &mut HashCache) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let lists = [
            (false, std::mem::take(&mut batch.add)),
            (true, std::mem::take(&mut batch.replace)),
        ];

        let mut failure = None;
        let mut flushed = Vec::new();
        for (replace, entries) in lists {
            if entries.is_empty() {
                continue;
            }
            if failure.is_none() {
                let files: Vec<Registration> = entries
                    .iter()
                    .map(|p| (p.storage_identifier.clone(), p.registered.clone()))
                    .collect();
                match self
                    .services
                    .destination
                    .register_files(&job.dataset, replace, &files, &job.credentials)
                    .await
                {
                    Ok(()) => {
                        debug!(
                            "Registered {} files in {} (replace: {})",
                            files.len(),
                            job.dataset,
                            replace
                        );
                        flushed.extend(entries);
                        continue;
                    }
                    Err(e) => failure = Some(e),
                }
            }
            for pending in entries {
                self.roll_back(job, pending.original, known).await;
            }
        }

        if let Some(e) = failure {
            return Err(e);
        }
        self.verify_registered(job, flushed, known).await
    }

    /// Compare the stored checksums of freshly registered files.
    async fn verify_registered(
        &self,
        job: &mut Job,
        flushed: Vec<PendingRegistration>,
        known: &mut HashCache,
    ) -> Result<()> {
        if flushed.is_empty() {
            return Ok(());
        }
        let listing = self
            .services
            .destination
            .list_files(&job.dataset, &job.credentials)
            .await?;
        let default_hash = &self.services.config.default_hash;

        let mut failure = None;
        for pending in flushed {
            let check = match listing.get(&pending.original.id) {
                Some(listed) => verify_stored(listed, &pending.checksum, default_hash)
                    .map_err(|e| (e, Some(listed.metadata.clone()))),
                None => Err((
                    Error::Destination(format!(
                        "{} missing from the listing after registration",
                        pending.original.id
                    )),
                    None,
                )),
            };
            if let Err((e, metadata)) = check {
                let mut node = pending.original;
                if let Some(metadata) = metadata {
                    node.metadata = metadata;
                    node.action = Action::Update;
                }
                self.roll_back(job, node, known).await;
                failure.get_or_insert(e);
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn roll_back(&self, job: &mut Job, node: Node, known: &mut HashCache) {
        known.remove(&node.id);
        let marker = keys::progress(job.dataset.as_str(), &node.id);
        if let Err(e) = self.services.store.delete(&marker).await {
            debug!("Could not clear marker of {}: {}", node.id, e);
        }
        job.writable_nodes.insert(node.id.clone(), node);
    }

    /// Fill the cache with source-algorithm digests of destination files.
    async fn rehash(&self, job: &mut Job, cancel: &CancellationToken) -> Result<()> {
        cancellable(
            cancel,
            self.services
                .destination
                .check_permission(&job.dataset, &job.credentials),
        )
        .await?;

        let mut known = self.hashes.get(&job.dataset).await?;
        let flush_every = self.services.config.cache_flush_every.max(1);
        let mut ids: Vec<String> = job.writable_nodes.keys().cloned().collect();
        ids.sort();

        let mut outcome = Ok(());
        for (i, id) in ids.iter().enumerate() {
            if cancel.is_cancelled() {
                outcome = Err(Error::Cancelled(format!("job {} stopped", job.id)));
                break;
            }
            if i > 0 && i % flush_every == 0 {
                self.store_hashes(job, &known).await;
            }
            let Some(node) = job.writable_nodes.get(id).cloned() else {
                continue;
            };
            if let Err(e) = self.rehash_node(job, &node, &mut known, cancel).await {
                outcome = Err(e);
                break;
            }
            job.writable_nodes.remove(id);
        }

        let stored = self.hashes.put(&job.dataset, &known).await;
        outcome?;
        stored?;
        info!("Computed hashes for {} files of {}", ids.len(), job.dataset);
        Ok(())
    }

    async fn rehash_node(
        &self,
        job: &Job,
        node: &Node,
        known: &mut HashCache,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Some(remote_type) = node.remote_hash_type.clone() else {
            return Ok(());
        };
        let (Some(file_id), Some(checksum)) =
            (node.metadata.file_id, node.metadata.checksum_value.clone())
        else {
            debug!("{} is not stored in {}", node.id, job.dataset);
            return Ok(());
        };
        let up_to_date = known.get(&node.id).is_some_and(|c| {
            c.local_hash_value == checksum && c.remote_hashes.contains_key(&remote_type)
        });
        if up_to_date {
            return Ok(());
        }
        let Some(hasher) = Hasher::new(&remote_type, node.metadata.file_size) else {
            warn!("Cannot compute {} for {}", remote_type, node.id);
            return Ok(());
        };

        let stream = cancellable(
            cancel,
            self.services
                .destination
                .download(&job.dataset, file_id, &job.credentials),
        )
        .await?;
        let value = cancellable(cancel, hash_stream(stream, hasher)).await?;

        let local_type = node
            .metadata
            .checksum_type
            .clone()
            .unwrap_or_else(|| self.services.config.default_hash.clone());
        let entry = known
            .entry(node.id.clone())
            .or_insert_with(|| CachedHashes::new(local_type.clone(), checksum.clone()));
        if entry.local_hash_value != checksum {
            *entry = CachedHashes::new(local_type, checksum);
        }
        entry.remote_hashes.insert(remote_type, value);
        Ok(())
    }

    /// Intermediate cache flush; failures only cost a later rehash.
    async fn store_hashes(&self, job: &Job, known: &HashCache) {
        if let Err(e) = self.hashes.put(&job.dataset, known).await {
            warn!("Could not store known hashes of {}: {}", job.dataset, e);
        }
    }

    async fn set_marker(&self, job: &Job, node: &str, value: &str) -> Result<()> {
        self.services
            .store
            .set(
                &keys::progress(job.dataset.as_str(), node),
                value,
                Some(self.services.config.progress_ttl),
            )
            .await
    }
}

fn is_redundant(node: &Node, cached: Option<&CachedHashes>) -> bool {
    let (Some(cached), Some(remote_type)) = (cached, &node.remote_hash_type) else {
        return false;
    };
    cached.remote_hashes.get(remote_type) == Some(&node.remote_hash)
        && node.metadata.checksum_value.as_deref() == Some(cached.local_hash_value.as_str())
}

/// Check the downloaded bytes against the source's declared hash.
///
/// Returns the source-algorithm value to remember for the node.
fn verify_remote(node: &Node, digest: &DualDigest) -> Result<Option<String>> {
    let Some(remote_type) = &node.remote_hash_type else {
        return Ok(None);
    };
    let Some(computed) = &digest.remote else {
        if node.remote_hash == NOT_NEEDED {
            return Ok(None);
        }
        debug!(
            "Cannot verify {} of {}, trusting the declared value",
            remote_type, node.id
        );
        return Ok(Some(node.remote_hash.clone()));
    };
    if node.remote_hash == NOT_NEEDED || *computed == node.remote_hash {
        return Ok(Some(computed.clone()));
    }
    // Some SharePoint libraries report quickXorHash values that never match.
    if *remote_type == HashType::QuickXor {
        warn!(
            "quickXorHash of {} not equal: declared {}, computed {}",
            node.id, node.remote_hash, computed
        );
        return Ok(Some(node.remote_hash.clone()));
    }
    Err(Error::DataIntegrity(format!(
        "downloaded file hash not equal for {}: declared {} {}, computed {}",
        node.id, remote_type, node.remote_hash, computed
    )))
}

/// Check what the destination reports having stored.
fn verify_stored(listed: &Node, expected: &str, default_hash: &HashType) -> Result<()> {
    if listed.local_hash_type.as_ref() != Some(default_hash) {
        debug!(
            "Destination reports {:?} for {}, skipping stored checksum check",
            listed.local_hash_type, listed.id
        );
        return Ok(());
    }
    if listed.local_hash != expected {
        return Err(Error::DataIntegrity(format!(
            "stored file hash not equal for {}: expected {}, destination has {}",
            listed.id, expected, listed.local_hash
        )));
    }
    Ok(())
}
