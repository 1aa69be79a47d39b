//! Local filesystem plugin.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use rdmsync_common::hash::hash_stream;
use rdmsync_common::stream::file_stream;
use rdmsync_common::{ByteStream, Error, HashType, Hasher, Result, NOT_NEEDED};
use rdmsync_tree::{Node, NodeMap};

use crate::plugin::{
    CompareRequest, NodeStream, OptionsRequest, Plugin, SelectItem, StreamParams, StreamSet,
};

/// Exposes a directory on this host as a source.
///
/// The request `url` is the directory, `option` an optional sub-folder.
pub struct LocalPlugin;

impl LocalPlugin {
    pub fn new() -> Self {
        Self
    }

    fn root(url: &str, option: &str) -> PathBuf {
        let root = PathBuf::from(url);
        if option.is_empty() {
            root
        } else {
            root.join(option)
        }
    }

    /// Resolve a node id below `root`, refusing ids that escape it.
    fn resolve(root: &Path, id: &str) -> Result<PathBuf> {
        let relative = Path::new(id);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(Error::InvalidInput(format!("invalid node id '{}'", id)));
        }
        Ok(root.join(relative))
    }

    /// Every file below `root`, as (id, path, size).
    async fn walk(root: &Path) -> Result<Vec<(String, PathBuf, u64)>> {
        let mut files = Vec::new();
        let mut pending = vec![root.to_path_buf()];

        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }
                if !file_type.is_file() {
                    continue;
                }
                let id = match path.strip_prefix(root).ok().and_then(relative_id) {
                    Some(id) => id,
                    None => {
                        warn!("Skipping non UTF-8 path {:?}", path);
                        continue;
                    }
                };
                let size = entry.metadata().await?.len();
                files.push((id, path, size));
            }
        }
        Ok(files)
    }
}

impl Default for LocalPlugin {
    fn default() -> Self {
        Self::new()
    }
}

/// Join path components with '/'.
fn relative_id(path: &Path) -> Option<String> {
    let parts: Option<Vec<&str>> = path.components().map(|c| c.as_os_str().to_str()).collect();
    parts.map(|p| p.join("/"))
}

#[async_trait]
impl Plugin for LocalPlugin {
    fn id(&self) -> &str {
        "local"
    }

    async fn query(&self, req: &CompareRequest, destination: &NodeMap) -> Result<NodeMap> {
        let root = Self::root(&req.url, &req.option);
        let mut nodes = NodeMap::new();

        for (id, path, size) in Self::walk(&root).await? {
            // Hash only what can be compared; new files are copied wholesale.
            let hash = if destination.contains_key(&id) {
                hash_stream(file_stream(&path).await?, Hasher::required(&HashType::Md5, None)?)
                    .await?
            } else {
                NOT_NEEDED.to_string()
            };
            let mut node = Node::file(id.clone()).with_remote(hash, HashType::Md5, size);
            node.url = path.to_string_lossy().into_owned();
            nodes.insert(id, node);
        }

        debug!("Local query of {:?} found {} files", root, nodes.len());
        Ok(nodes)
    }

    async fn options(&self, req: &OptionsRequest) -> Result<Vec<SelectItem>> {
        let root = Self::root(&req.url, &req.option);
        let mut items = Vec::new();
        let mut entries = fs::read_dir(&root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                let value = if req.option.is_empty() {
                    name.to_string()
                } else {
                    format!("{}/{}", req.option, name)
                };
                items.push(SelectItem::new(name, value));
            }
        }
        items.sort_by(|a, b| a.label.cmp(&b.label));
        Ok(items)
    }

    async fn streams(&self, nodes: &NodeMap, params: &StreamParams) -> Result<StreamSet> {
        let root = Self::root(&params.url, &params.option);
        let mut set = StreamSet::default();
        for (id, node) in nodes {
            if !node.is_file || !node.action.needs_stream() {
                continue;
            }
            let path = Self::resolve(&root, id)?;
            set.streams
                .insert(id.clone(), Box::new(LocalFileStream::new(path)));
        }
        Ok(set)
    }
}

/// File opened on first use.
pub struct LocalFileStream {
    path: PathBuf,
    opened: bool,
}

impl LocalFileStream {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            opened: false,
        }
    }
}

#[async_trait]
impl NodeStream for LocalFileStream {
    async fn open(&mut self) -> Result<ByteStream> {
        if self.opened {
            return Err(Error::InvalidInput(format!(
                "{:?} was already opened",
                self.path
            )));
        }
        self.opened = true;
        file_stream(&self.path).await
    }

    async fn close(&mut self) -> Result<()> {
        // The file handle is owned by the returned stream.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rdmsync_common::stream::collect;
    use rdmsync_tree::Action;
    use tempfile::TempDir;

    async fn fixture() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("sub/deeper")).await.unwrap();
        fs::write(dir.path().join("top.txt"), b"hello").await.unwrap();
        fs::write(dir.path().join("sub/a.txt"), b"aaa").await.unwrap();
        fs::write(dir.path().join("sub/deeper/b.txt"), b"bb").await.unwrap();
        dir
    }

    fn request(dir: &TempDir) -> CompareRequest {
        CompareRequest {
            plugin: "local".to_string(),
            url: dir.path().to_string_lossy().into_owned(),
            ..CompareRequest::default()
        }
    }

    #[tokio::test]
    async fn test_query_hashes_only_known_files() {
        let dir = fixture().await;
        let mut destination = NodeMap::new();
        destination.insert("top.txt".to_string(), Node::file("top.txt"));

        let nodes = LocalPlugin::new()
            .query(&request(&dir), &destination)
            .await
            .unwrap();

        assert_eq!(nodes.len(), 3);
        let top = &nodes["top.txt"];
        assert_eq!(top.remote_hash, "5d41402abc4b2a76b9719d911017c592");
        assert_eq!(top.remote_hash_type, Some(HashType::Md5));
        assert_eq!(top.remote_file_size, 5);

        let b = &nodes["sub/deeper/b.txt"];
        assert_eq!(b.remote_hash, NOT_NEEDED);
        assert_eq!(b.path, "sub/deeper");
        assert_eq!(b.name, "b.txt");
    }

    #[tokio::test]
    async fn test_options_lists_folders() {
        let dir = fixture().await;
        let req = OptionsRequest {
            url: dir.path().to_string_lossy().into_owned(),
            ..OptionsRequest::default()
        };
        let items = LocalPlugin::new().options(&req).await.unwrap();
        assert_eq!(items, vec![SelectItem::new("sub", "sub")]);
    }

    #[tokio::test]
    async fn test_streams_open_once() {
        let dir = fixture().await;
        let mut nodes = NodeMap::new();
        nodes.insert(
            "sub/a.txt".to_string(),
            Node::file("sub/a.txt").with_action(Action::Copy),
        );
        nodes.insert(
            "top.txt".to_string(),
            Node::file("top.txt").with_action(Action::Delete),
        );
        let params = StreamParams {
            url: dir.path().to_string_lossy().into_owned(),
            ..StreamParams::default()
        };

        let mut set = LocalPlugin::new().streams(&nodes, &params).await.unwrap();
        assert_eq!(set.streams.len(), 1);
        assert!(!set.is_deferred());

        let stream = set.streams.get_mut("sub/a.txt").unwrap();
        let bytes = collect(stream.open().await.unwrap()).await.unwrap();
        assert_eq!(bytes, b"aaa");
        assert!(stream.open().await.is_err());
        stream.close().await.unwrap();
        stream.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_streams_reject_escaping_ids() {
        let dir = fixture().await;
        let mut nodes = NodeMap::new();
        nodes.insert(
            "../etc/passwd".to_string(),
            Node::file("../etc/passwd").with_action(Action::Copy),
        );
        let params = StreamParams {
            url: dir.path().to_string_lossy().into_owned(),
            ..StreamParams::default()
        };
        let result = LocalPlugin::new().streams(&nodes, &params).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
