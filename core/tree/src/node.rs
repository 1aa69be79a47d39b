//! File and folder entries of a sync tree.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use rdmsync_common::HashType;

/// Flattened tree snapshot keyed by node id.
pub type NodeMap = HashMap<String, Node>;

/// Operation the user picked for a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    #[default]
    None,
    Copy,
    Update,
    Delete,
}

impl Action {
    /// Copy and Update need bytes from the source.
    pub fn needs_stream(self) -> bool {
        matches!(self, Action::Copy | Action::Update)
    }
}

/// Outcome of the last comparison for a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Equal,
    New,
    Updated,
    Deleted,
    #[default]
    Unknown,
}

/// Destination-side linkage of a stored file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DestinationFile {
    /// Numeric file id at the destination.
    pub file_id: Option<u64>,
    pub storage_identifier: Option<String>,
    pub checksum_type: Option<HashType>,
    pub checksum_value: Option<String>,
    pub file_size: Option<u64>,
}

impl DestinationFile {
    /// A file is replaced rather than added when the destination already knows it.
    pub fn exists(&self) -> bool {
        self.file_id.is_some()
    }
}

/// One file or folder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Node {
    /// Slash-separated path relative to the dataset root.
    pub id: String,
    pub name: String,
    /// Parent id, empty at the root.
    pub path: String,
    pub is_file: bool,
    pub local_hash: String,
    pub local_hash_type: Option<HashType>,
    pub remote_hash: String,
    pub remote_hash_type: Option<HashType>,
    pub remote_file_size: u64,
    /// Source-side locator, opaque to the engine.
    pub url: String,
    pub action: Action,
    pub status: Status,
    pub metadata: DestinationFile,
}

impl Node {
    /// Create a file node; name and path are derived from the id.
    pub fn file(id: impl Into<String>) -> Self {
        let id = id.into();
        let (path, name) = {
            let (path, name) = split_id(&id);
            (path.to_string(), name.to_string())
        };
        Self {
            name,
            path,
            is_file: true,
            id,
            ..Self::default()
        }
    }

    /// Create a folder node.
    pub fn folder(id: impl Into<String>) -> Self {
        Self {
            is_file: false,
            ..Self::file(id)
        }
    }

    /// Set the hash as stored at the destination.
    pub fn with_local(mut self, hash: impl Into<String>, hash_type: HashType) -> Self {
        self.local_hash = hash.into();
        self.local_hash_type = Some(hash_type);
        self
    }

    /// Set the hash and size as reported by the source.
    pub fn with_remote(mut self, hash: impl Into<String>, hash_type: HashType, size: u64) -> Self {
        self.remote_hash = hash.into();
        self.remote_hash_type = Some(hash_type);
        self.remote_file_size = size;
        self
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.action = action;
        self
    }

    pub fn with_metadata(mut self, metadata: DestinationFile) -> Self {
        self.metadata = metadata;
        self
    }

    /// Forget everything the destination said about this node.
    pub fn clear_local(&mut self) {
        self.local_hash.clear();
        self.local_hash_type = None;
        self.metadata = DestinationFile::default();
    }

    /// Forget everything the source said about this node.
    pub fn clear_remote(&mut self) {
        self.remote_hash.clear();
        self.remote_hash_type = None;
        self.remote_file_size = 0;
        self.url.clear();
    }
}

/// Split `a/b/c.txt` into (`a/b`, `c.txt`).
pub fn split_id(id: &str) -> (&str, &str) {
    match id.rsplit_once('/') {
        Some((path, name)) => (path, name),
        None => ("", id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_node_from_id() {
        let node = Node::file("data/raw/a.csv");
        assert_eq!(node.name, "a.csv");
        assert_eq!(node.path, "data/raw");
        assert!(node.is_file);

        let root = Node::file("README.md");
        assert_eq!(root.path, "");
        assert_eq!(root.name, "README.md");
    }

    #[test]
    fn test_action_streams() {
        assert!(Action::Copy.needs_stream());
        assert!(Action::Update.needs_stream());
        assert!(!Action::Delete.needs_stream());
        assert!(!Action::None.needs_stream());
    }

    #[test]
    fn test_node_serialization() {
        let node = Node::file("a/b.txt")
            .with_local("abc", HashType::Md5)
            .with_action(Action::Update);
        let json = serde_json::to_string(&node).unwrap();
        assert!(json.contains("\"localHashType\":\"MD5\""));
        assert!(json.contains("\"action\":\"update\""));
        let back: Node = serde_json::from_str(&json).unwrap();
        assert_eq!(back, node);
    }
}
