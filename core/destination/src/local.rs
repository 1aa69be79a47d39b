//! Local directory destination.
//!
//! Each dataset is a directory holding the registered files, a staging
//! area for uploads and a JSON index of what is registered.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use rdmsync_common::hash::hash_stream;
use rdmsync_common::stream::file_stream;
use rdmsync_common::{ByteStream, Credentials, DatasetId, Error, HashType, Hasher, Result};
use rdmsync_tree::{DestinationFile, Node, NodeMap};

use crate::destination::{Destination, DestinationCapabilities, Registration};

const INDEX_FILE: &str = "index.json";
const FILES_DIR: &str = "files";
const STAGING_DIR: &str = "staging";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    file_id: u64,
    checksum: String,
    size: u64,
    storage_identifier: String,
    registered_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DatasetIndex {
    next_id: u64,
    files: BTreeMap<String, IndexEntry>,
}

/// Destination backed by a directory on this host.
pub struct LocalDestination {
    root: PathBuf,
    hash_type: HashType,
    /// Serializes index read-modify-write cycles within this process.
    index_lock: Mutex<()>,
}

impl LocalDestination {
    /// Create a destination rooted at `root`.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.exists() {
            std::fs::create_dir_all(&root)?;
        }
        Ok(Self {
            root,
            hash_type: HashType::Md5,
            index_lock: Mutex::new(()),
        })
    }

    pub fn with_hash_type(mut self, hash_type: HashType) -> Self {
        self.hash_type = hash_type;
        self
    }

    fn dataset_dir(&self, dataset: &DatasetId) -> PathBuf {
        let safe: String = dataset
            .as_str()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        self.root.join(safe)
    }

    fn file_path(&self, dataset: &DatasetId, id: &str) -> Result<PathBuf> {
        let relative = Path::new(id);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::InvalidInput(format!("invalid file id '{}'", id)));
        }
        Ok(self.dataset_dir(dataset).join(FILES_DIR).join(relative))
    }

    async fn read_index(&self, dataset: &DatasetId) -> Result<DatasetIndex> {
        let path = self.dataset_dir(dataset).join(INDEX_FILE);
        match fs::read_to_string(&path).await {
            Ok(json) => Ok(serde_json::from_str(&json)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(DatasetIndex {
                next_id: 1,
                files: BTreeMap::new(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_index(&self, dataset: &DatasetId, index: &DatasetIndex) -> Result<()> {
        let dir = self.dataset_dir(dataset);
        fs::create_dir_all(&dir).await?;
        let tmp = dir.join(format!("{}.tmp", INDEX_FILE));
        fs::write(&tmp, serde_json::to_string_pretty(index)?).await?;
        fs::rename(&tmp, dir.join(INDEX_FILE)).await?;
        Ok(())
    }

    async fn write_stream(path: &Path, mut data: ByteStream) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::File::create(path).await?;
        while let Some(chunk) = data.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn checksum_of(&self, path: &Path) -> Result<String> {
        hash_stream(file_stream(path).await?, Hasher::required(&self.hash_type, None)?).await
    }

    /// Move a stored file into place and record it in the index.
    async fn register_one(
        &self,
        dataset: &DatasetId,
        index: &mut DatasetIndex,
        source: &Path,
        storage_identifier: &str,
        node: &Node,
    ) -> Result<()> {
        let target = self.file_path(dataset, &node.id)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(source, &target).await?;
        let checksum = self.checksum_of(&target).await?;
        let size = fs::metadata(&target).await?.len();
        let file_id = index.next_id;
        index.next_id += 1;
        index.files.insert(
            node.id.clone(),
            IndexEntry {
                file_id,
                checksum,
                size,
                storage_identifier: storage_identifier.to_string(),
                registered_at: Utc::now(),
            },
        );
        debug!(dataset = %dataset, file = %node.id, file_id, "Registered file");
        Ok(())
    }
}

#[async_trait]
impl Destination for LocalDestination {
    fn name(&self) -> &str {
        "local"
    }

    fn capabilities(&self) -> DestinationCapabilities {
        DestinationCapabilities::default()
    }

    async fn list_files(&self, dataset: &DatasetId, _creds: &Credentials) -> Result<NodeMap> {
        let index = self.read_index(dataset).await?;
        Ok(index
            .files
            .iter()
            .map(|(id, entry)| {
                let node = Node::file(id.clone())
                    .with_local(entry.checksum.clone(), self.hash_type.clone())
                    .with_metadata(DestinationFile {
                        file_id: Some(entry.file_id),
                        storage_identifier: Some(entry.storage_identifier.clone()),
                        checksum_type: Some(self.hash_type.clone()),
                        checksum_value: Some(entry.checksum.clone()),
                        file_size: Some(entry.size),
                    });
                (id.clone(), node)
            })
            .collect())
    }

    async fn check_permission(&self, _dataset: &DatasetId, _creds: &Credentials) -> Result<()> {
        // The local user owns the directory.
        Ok(())
    }

    async fn create_dataset(&self, collection: &str, _creds: &Credentials) -> Result<DatasetId> {
        let id = DatasetId::new(format!("{}:{}", collection, Uuid::new_v4()))?;
        let _guard = self.index_lock.lock().await;
        self.write_index(
            &id,
            &DatasetIndex {
                next_id: 1,
                files: BTreeMap::new(),
            },
        )
        .await?;
        Ok(id)
    }

    async fn upload_to_storage(
        &self,
        dataset: &DatasetId,
        _node: &Node,
        data: ByteStream,
        _creds: &Credentials,
    ) -> Result<String> {
        let storage_identifier = Uuid::new_v4().to_string();
        let path = self
            .dataset_dir(dataset)
            .join(STAGING_DIR)
            .join(&storage_identifier);
        Self::write_stream(&path, data).await?;
        Ok(storage_identifier)
    }

    async fn register_files(
        &self,
        dataset: &DatasetId,
        replace: bool,
        files: &[Registration],
        _creds: &Credentials,
    ) -> Result<()> {
        let _guard = self.index_lock.lock().await;
        let mut index = self.read_index(dataset).await?;
        let staging = self.dataset_dir(dataset).join(STAGING_DIR);

        for (storage_identifier, node) in files {
            if !replace && index.files.contains_key(&node.id) {
                return Err(Error::AlreadyExists(format!("{} in {}", node.id, dataset)));
            }
            let source = staging.join(storage_identifier);
            if let Err(e) = self
                .register_one(dataset, &mut index, &source, storage_identifier, node)
                .await
            {
                self.write_index(dataset, &index).await?;
                return Err(e);
            }
        }
        self.write_index(dataset, &index).await
    }

    async fn add_file_legacy(
        &self,
        dataset: &DatasetId,
        node: &Node,
        data: ByteStream,
        creds: &Credentials,
    ) -> Result<()> {
        let storage_identifier = self.upload_to_storage(dataset, node, data, creds).await?;
        self.register_files(dataset, true, &[(storage_identifier, node.clone())], creds)
            .await
    }

    async fn delete_file(
        &self,
        dataset: &DatasetId,
        file_id: u64,
        _creds: &Credentials,
    ) -> Result<()> {
        let _guard = self.index_lock.lock().await;
        let mut index = self.read_index(dataset).await?;
        let id = index
            .files
            .iter()
            .find(|(_, entry)| entry.file_id == file_id)
            .map(|(id, _)| id.clone())
            .ok_or_else(|| Error::NotFound(format!("file {} in {}", file_id, dataset)))?;
        match fs::remove_file(self.file_path(dataset, &id)?).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        index.files.remove(&id);
        self.write_index(dataset, &index).await
    }

    async fn cleanup_storage(&self, dataset: &DatasetId, _creds: &Credentials) -> Result<()> {
        let staging = self.dataset_dir(dataset).join(STAGING_DIR);
        match fs::remove_dir_all(&staging).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn download(
        &self,
        dataset: &DatasetId,
        file_id: u64,
        _creds: &Credentials,
    ) -> Result<ByteStream> {
        let index = self.read_index(dataset).await?;
        let id = index
            .files
            .iter()
            .find(|(_, entry)| entry.file_id == file_id)
            .map(|(id, _)| id.clone())
            .ok_or_else(|| Error::NotFound(format!("file {} in {}", file_id, dataset)))?;
        file_stream(self.file_path(dataset, &id)?).await
    }

    async fn user_email(&self, creds: &Credentials) -> Result<String> {
        Ok(format!("{}@localhost", creds.user))
    }
}
