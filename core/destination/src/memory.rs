//! In-memory destination for testing.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

use rdmsync_common::hash::hash_bytes;
use rdmsync_common::stream::{bytes_stream, collect};
use rdmsync_common::{ByteStream, Credentials, DatasetId, Error, HashType, Result};
use rdmsync_tree::{DestinationFile, Node, NodeMap};

use crate::destination::{Destination, DestinationCapabilities, Registration};

#[derive(Debug, Clone)]
struct StoredFile {
    file_id: u64,
    data: Vec<u8>,
    checksum: String,
    storage_identifier: String,
}

#[derive(Debug, Clone)]
struct PendingDeposit {
    dataset: String,
    id: String,
    file: StoredFile,
    listings_left: u32,
}

#[derive(Debug, Default)]
struct State {
    datasets: HashMap<String, HashMap<String, StoredFile>>,
    staged: HashMap<String, Vec<u8>>,
    pending: Vec<PendingDeposit>,
    next_id: u64,
    denied: HashSet<String>,
    orphans: usize,
    failing_registrations: u32,
    corrupt_writes: u32,
    listing_lag: u32,
    stats: DestinationStats,
}

/// Call counters, for assertions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DestinationStats {
    pub listings: usize,
    pub registrations: usize,
    pub legacy_deposits: usize,
    pub native_deletes: usize,
    pub legacy_deletes: usize,
    pub cleanups: usize,
    pub downloads: usize,
}

/// Destination held entirely in memory.
///
/// Checksums are computed from the stored bytes, so tampering with the
/// stored data is visible through the listing. Clones share state.
#[derive(Clone)]
pub struct MemoryDestination {
    state: Arc<Mutex<State>>,
    capabilities: DestinationCapabilities,
    hash_type: HashType,
}

impl MemoryDestination {
    /// Create a new empty destination storing MD5 checksums.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                next_id: 1,
                ..State::default()
            })),
            capabilities: DestinationCapabilities::default(),
            hash_type: HashType::Md5,
        }
    }

    pub fn with_capabilities(mut self, capabilities: DestinationCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_hash_type(mut self, hash_type: HashType) -> Self {
        self.hash_type = hash_type;
        self
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::Destination("memory destination lock poisoned".to_string()))
    }

    fn checksum(&self, data: &[u8]) -> Result<String> {
        hash_bytes(&self.hash_type, data)
    }

    /// Store a file directly, as if it had been there all along.
    pub fn seed(&self, dataset: &str, id: &str, data: &[u8]) -> Result<u64> {
        let checksum = self.checksum(data)?;
        let mut state = self.lock()?;
        let file_id = state.next_id;
        state.next_id += 1;
        state.datasets.entry(dataset.to_string()).or_default().insert(
            id.to_string(),
            StoredFile {
                file_id,
                data: data.to_vec(),
                checksum,
                storage_identifier: format!("seed://{}", file_id),
            },
        );
        Ok(file_id)
    }

    /// Replace stored bytes behind the engine's back.
    pub fn tamper(&self, dataset: &str, id: &str, data: &[u8]) -> Result<()> {
        let checksum = self.checksum(data)?;
        let mut state = self.lock()?;
        let file = state
            .datasets
            .get_mut(dataset)
            .and_then(|files| files.get_mut(id))
            .ok_or_else(|| Error::NotFound(format!("{} in {}", id, dataset)))?;
        file.data = data.to_vec();
        file.checksum = checksum;
        Ok(())
    }

    /// Stored bytes of a file.
    pub fn file_bytes(&self, dataset: &str, id: &str) -> Option<Vec<u8>> {
        let state = self.lock().ok()?;
        state
            .datasets
            .get(dataset)
            .and_then(|files| files.get(id))
            .map(|f| f.data.clone())
    }

    /// Ids of the files in a dataset, sorted.
    pub fn file_ids(&self, dataset: &str) -> Vec<String> {
        let Ok(state) = self.lock() else {
            return Vec::new();
        };
        let mut ids: Vec<String> = state
            .datasets
            .get(dataset)
            .map(|files| files.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Refuse edit permission to a user.
    pub fn deny(&self, user: &str) -> Result<()> {
        self.lock()?.denied.insert(user.to_string());
        Ok(())
    }

    /// The next `n` registration calls fail.
    pub fn fail_next_registrations(&self, n: u32) -> Result<()> {
        self.lock()?.failing_registrations = n;
        Ok(())
    }

    /// The next `n` stored files get one byte flipped.
    pub fn corrupt_next_writes(&self, n: u32) -> Result<()> {
        self.lock()?.corrupt_writes = n;
        Ok(())
    }

    /// Legacy deposits stay invisible for this many listings.
    pub fn set_listing_lag(&self, listings: u32) -> Result<()> {
        self.lock()?.listing_lag = listings;
        Ok(())
    }

    pub fn stats(&self) -> DestinationStats {
        self.lock().map(|s| s.stats.clone()).unwrap_or_default()
    }

    /// Storage left behind by replaced files and not yet cleaned up.
    pub fn orphans(&self) -> usize {
        self.lock().map(|s| s.orphans).unwrap_or_default()
    }

    fn maybe_corrupt(state: &mut State, data: &mut [u8]) {
        if state.corrupt_writes > 0 {
            state.corrupt_writes -= 1;
            if let Some(first) = data.first_mut() {
                *first ^= 0xff;
            }
        }
    }
}

impl Default for MemoryDestination {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    fn name(&self) -> &str {
        "memory"
    }

    fn capabilities(&self) -> DestinationCapabilities {
        self.capabilities
    }

    async fn list_files(&self, dataset: &DatasetId, _creds: &Credentials) -> Result<NodeMap> {
        let mut state = self.lock()?;
        state.stats.listings += 1;

        let mut visible = Vec::new();
        state.pending.retain_mut(|p| {
            if p.dataset == dataset.as_str() && p.listings_left == 0 {
                visible.push((p.id.clone(), p.file.clone()));
                return false;
            }
            if p.dataset == dataset.as_str() {
                p.listings_left -= 1;
            }
            true
        });
        let files = state.datasets.entry(dataset.to_string()).or_default();
        for (id, file) in visible {
            files.insert(id, file);
        }

        Ok(files
            .iter()
            .map(|(id, file)| {
                let node = Node::file(id.clone())
                    .with_local(file.checksum.clone(), self.hash_type.clone())
                    .with_metadata(DestinationFile {
                        file_id: Some(file.file_id),
                        storage_identifier: Some(file.storage_identifier.clone()),
                        checksum_type: Some(self.hash_type.clone()),
                        checksum_value: Some(file.checksum.clone()),
                        file_size: Some(file.data.len() as u64),
                    });
                (id.clone(), node)
            })
            .collect())
    }

    async fn check_permission(&self, dataset: &DatasetId, creds: &Credentials) -> Result<()> {
        if self.lock()?.denied.contains(&creds.user) {
            return Err(Error::PermissionDenied(format!(
                "user {} may not edit {}",
                creds.user, dataset
            )));
        }
        Ok(())
    }

    async fn create_dataset(&self, collection: &str, _creds: &Credentials) -> Result<DatasetId> {
        let id = DatasetId::new(format!("{}:{}", collection, Uuid::new_v4()))?;
        self.lock()?.datasets.insert(id.to_string(), HashMap::new());
        Ok(id)
    }

    async fn upload_to_storage(
        &self,
        _dataset: &DatasetId,
        _node: &Node,
        data: ByteStream,
        _creds: &Credentials,
    ) -> Result<String> {
        let mut bytes = collect(data).await?;
        let storage_identifier = format!("mem://{}", Uuid::new_v4());
        let mut state = self.lock()?;
        Self::maybe_corrupt(&mut state, &mut bytes);
        state.staged.insert(storage_identifier.clone(), bytes);
        Ok(storage_identifier)
    }

    async fn register_files(
        &self,
        dataset: &DatasetId,
        replace: bool,
        files: &[Registration],
        _creds: &Credentials,
    ) -> Result<()> {
        let mut state = self.lock()?;
        state.stats.registrations += 1;
        if state.failing_registrations > 0 {
            state.failing_registrations -= 1;
            return Err(Error::Destination("registration rejected".to_string()));
        }

        for (storage_identifier, node) in files {
            let data = state.staged.remove(storage_identifier).ok_or_else(|| {
                Error::NotFound(format!("nothing uploaded as {}", storage_identifier))
            })?;
            let checksum = self.checksum(&data)?;
            let file_id = state.next_id;
            state.next_id += 1;
            let entries = state.datasets.entry(dataset.to_string()).or_default();
            if !replace && entries.contains_key(&node.id) {
                return Err(Error::AlreadyExists(format!("{} in {}", node.id, dataset)));
            }
            let replaced = entries.insert(
                node.id.clone(),
                StoredFile {
                    file_id,
                    data,
                    checksum,
                    storage_identifier: storage_identifier.clone(),
                },
            );
            if replaced.is_some() {
                state.orphans += 1;
            }
        }
        Ok(())
    }

    async fn add_file_legacy(
        &self,
        dataset: &DatasetId,
        node: &Node,
        data: ByteStream,
        _creds: &Credentials,
    ) -> Result<()> {
        let mut bytes = collect(data).await?;
        let mut state = self.lock()?;
        state.stats.legacy_deposits += 1;
        Self::maybe_corrupt(&mut state, &mut bytes);
        let checksum = self.checksum(&bytes)?;
        let file_id = state.next_id;
        state.next_id += 1;
        if let Some(old) = node.metadata.file_id {
            if let Some(files) = state.datasets.get_mut(dataset.as_str()) {
                files.retain(|_, f| f.file_id != old);
            }
        }
        let listings_left = state.listing_lag;
        state.pending.push(PendingDeposit {
            dataset: dataset.to_string(),
            id: node.id.clone(),
            file: StoredFile {
                file_id,
                data: bytes,
                checksum,
                storage_identifier: format!("deposit://{}", file_id),
            },
            listings_left,
        });
        Ok(())
    }

    async fn delete_file(
        &self,
        dataset: &DatasetId,
        file_id: u64,
        _creds: &Credentials,
    ) -> Result<()> {
        let mut state = self.lock()?;
        if self.capabilities.native_delete {
            state.stats.native_deletes += 1;
        } else {
            state.stats.legacy_deletes += 1;
        }
        let files = state
            .datasets
            .get_mut(dataset.as_str())
            .ok_or_else(|| Error::NotFound(format!("dataset {}", dataset)))?;
        let before = files.len();
        files.retain(|_, f| f.file_id != file_id);
        if files.len() == before {
            return Err(Error::NotFound(format!("file {} in {}", file_id, dataset)));
        }
        Ok(())
    }

    async fn cleanup_storage(&self, _dataset: &DatasetId, _creds: &Credentials) -> Result<()> {
        if !self.capabilities.cleanup_storage {
            return Err(Error::Unsupported(
                "storage cleanup needs a newer destination".to_string(),
            ));
        }
        let mut state = self.lock()?;
        state.stats.cleanups += 1;
        state.orphans = 0;
        Ok(())
    }

    async fn download(
        &self,
        dataset: &DatasetId,
        file_id: u64,
        _creds: &Credentials,
    ) -> Result<ByteStream> {
        let mut state = self.lock()?;
        state.stats.downloads += 1;
        let data = state
            .datasets
            .get(dataset.as_str())
            .and_then(|files| files.values().find(|f| f.file_id == file_id))
            .map(|f| f.data.clone())
            .ok_or_else(|| Error::NotFound(format!("file {} in {}", file_id, dataset)))?;
        Ok(bytes_stream(data))
    }

    async fn user_email(&self, creds: &Credentials) -> Result<String> {
        Ok(format!("{}@example.org", creds.user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset() -> DatasetId {
        DatasetId::new("doi:10.5072/FK2/TEST").unwrap()
    }

    fn creds() -> Credentials {
        Credentials::new("alice", "token")
    }

    #[tokio::test]
    async fn test_seed_and_list() {
        let dest = MemoryDestination::new();
        let id = dest.seed(dataset().as_str(), "a/b.txt", b"hello").unwrap();

        let nodes = dest.list_files(&dataset(), &creds()).await.unwrap();
        let node = &nodes["a/b.txt"];
        assert_eq!(node.local_hash, "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(node.local_hash_type, Some(HashType::Md5));
        assert_eq!(node.metadata.file_id, Some(id));
        assert_eq!(node.metadata.file_size, Some(5));
    }

    #[tokio::test]
    async fn test_direct_upload_and_replace() {
        let dest = MemoryDestination::new();
        let old = dest.seed(dataset().as_str(), "a.txt", b"old").unwrap();

        let mut node = Node::file("a.txt");
        node.metadata.file_id = Some(old);
        let sid = dest
            .upload_to_storage(&dataset(), &node, bytes_stream(b"new".to_vec()), &creds())
            .await
            .unwrap();
        dest.register_files(&dataset(), true, &[(sid, node)], &creds())
            .await
            .unwrap();

        assert_eq!(dest.file_bytes(dataset().as_str(), "a.txt").unwrap(), b"new");
        assert_eq!(dest.orphans(), 1);
        dest.cleanup_storage(&dataset(), &creds()).await.unwrap();
        assert_eq!(dest.orphans(), 0);
    }

    #[tokio::test]
    async fn test_legacy_deposit_appears_after_lag() {
        let dest = MemoryDestination::new().with_capabilities(DestinationCapabilities {
            direct_upload: false,
            native_delete: false,
            cleanup_storage: false,
        });
        dest.set_listing_lag(2).unwrap();
        dest.add_file_legacy(
            &dataset(),
            &Node::file("x.txt"),
            bytes_stream(b"x".to_vec()),
            &creds(),
        )
        .await
        .unwrap();

        assert!(dest.list_files(&dataset(), &creds()).await.unwrap().is_empty());
        assert!(dest.list_files(&dataset(), &creds()).await.unwrap().is_empty());
        let nodes = dest.list_files(&dataset(), &creds()).await.unwrap();
        assert!(nodes.contains_key("x.txt"));

        let file_id = nodes["x.txt"].metadata.file_id.unwrap();
        dest.delete_file(&dataset(), file_id, &creds()).await.unwrap();
        assert_eq!(dest.stats().legacy_deletes, 1);
        assert!(matches!(
            dest.cleanup_storage(&dataset(), &creds()).await,
            Err(Error::Unsupported(_))
        ));
    }

    #[tokio::test]
    async fn test_permission_and_download() {
        let dest = MemoryDestination::new();
        let id = dest.seed(dataset().as_str(), "a.txt", b"abc").unwrap();
        dest.deny("mallory").unwrap();

        let denied = dest
            .check_permission(&dataset(), &Credentials::new("mallory", "t"))
            .await;
        assert!(matches!(denied, Err(Error::PermissionDenied(_))));
        dest.check_permission(&dataset(), &creds()).await.unwrap();

        let bytes = collect(dest.download(&dataset(), id, &creds()).await.unwrap())
            .await
            .unwrap();
        assert_eq!(bytes, b"abc");
        assert!(dest.download(&dataset(), 999, &creds()).await.is_err());
    }
}
