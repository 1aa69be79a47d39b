//! Destination repository trait definition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use rdmsync_common::{ByteStream, Credentials, DatasetId, Error, Result};
use rdmsync_tree::{Node, NodeMap};

/// Optional behaviour of a destination, usually tied to its server version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationCapabilities {
    /// Bytes go straight to storage and are registered with one call.
    /// Otherwise files are deposited the legacy way and only show up in
    /// the listing some time later.
    pub direct_upload: bool,
    /// Delete by numeric id instead of the archival-deposit protocol.
    pub native_delete: bool,
    /// Orphaned storage of replaced files can be removed.
    pub cleanup_storage: bool,
}

impl Default for DestinationCapabilities {
    fn default() -> Self {
        Self {
            direct_upload: true,
            native_delete: true,
            cleanup_storage: true,
        }
    }
}

/// A (storage identifier, node) pair ready for registration.
pub type Registration = (String, Node);

fn unsupported(name: &str, operation: &str) -> Error {
    Error::Unsupported(format!("destination '{}' does not support {}", name, operation))
}

/// Research-data repository holding the canonical dataset.
#[async_trait]
pub trait Destination: Send + Sync {
    /// Get the destination name.
    fn name(&self) -> &str;

    fn capabilities(&self) -> DestinationCapabilities;

    /// List the files of a dataset.
    ///
    /// # Postconditions
    /// - Each node carries `local_hash`/`local_hash_type` and its metadata
    ///   (file id, storage identifier, checksum, size)
    async fn list_files(&self, dataset: &DatasetId, creds: &Credentials) -> Result<NodeMap>;

    /// Verify the user may edit the dataset.
    ///
    /// # Errors
    /// - `PermissionDenied` when the user lacks edit rights or the token is invalid
    async fn check_permission(&self, dataset: &DatasetId, creds: &Credentials) -> Result<()>;

    /// Create a draft dataset inside a collection.
    async fn create_dataset(&self, _collection: &str, _creds: &Credentials) -> Result<DatasetId> {
        Err(unsupported(self.name(), "dataset creation"))
    }

    /// Write bytes to the destination's storage without registering them.
    ///
    /// Returns the storage identifier to register later.
    async fn upload_to_storage(
        &self,
        _dataset: &DatasetId,
        _node: &Node,
        _data: ByteStream,
        _creds: &Credentials,
    ) -> Result<String> {
        Err(unsupported(self.name(), "direct upload"))
    }

    /// Register uploaded files; `replace` swaps out the files named by each
    /// node's `metadata.file_id`.
    async fn register_files(
        &self,
        _dataset: &DatasetId,
        _replace: bool,
        _files: &[Registration],
        _creds: &Credentials,
    ) -> Result<()> {
        Err(unsupported(self.name(), "direct registration"))
    }

    /// Deposit a file the legacy way. It appears in the listing eventually.
    async fn add_file_legacy(
        &self,
        _dataset: &DatasetId,
        _node: &Node,
        _data: ByteStream,
        _creds: &Credentials,
    ) -> Result<()> {
        Err(unsupported(self.name(), "legacy deposit"))
    }

    /// Delete a file by its destination id.
    async fn delete_file(&self, dataset: &DatasetId, file_id: u64, creds: &Credentials)
        -> Result<()>;

    /// Remove storage left behind by replaced files.
    async fn cleanup_storage(&self, _dataset: &DatasetId, _creds: &Credentials) -> Result<()> {
        Err(unsupported(self.name(), "storage cleanup"))
    }

    /// Stream the stored bytes of a file.
    async fn download(
        &self,
        dataset: &DatasetId,
        file_id: u64,
        creds: &Credentials,
    ) -> Result<ByteStream>;

    /// Email address of the acting user.
    async fn user_email(&self, _creds: &Credentials) -> Result<String> {
        Err(unsupported(self.name(), "user lookup"))
    }
}
