//! Plugin trait definition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use rdmsync_common::{ByteStream, Error, Result};
use rdmsync_tree::NodeMap;

/// Source selection submitted with a compare.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CompareRequest {
    /// Configured plugin instance.
    pub plugin_id: String,
    /// Backend identifier used for registry lookup.
    pub plugin: String,
    pub repo_name: String,
    pub url: String,
    /// Sub-location (branch, folder, drive) picked via `options`.
    pub option: String,
    pub user: String,
    /// Source-side token.
    pub token: String,
    pub persistent_id: String,
    pub newly_created: bool,
    pub session_id: String,
}

/// Parameters of an `options` or `search` lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OptionsRequest {
    pub plugin_id: String,
    pub plugin: String,
    pub repo_name: String,
    pub option: String,
    pub url: String,
    pub user: String,
    pub token: String,
}

/// Connection parameters a job carries to reopen the source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StreamParams {
    pub plugin_id: String,
    pub repo_name: String,
    pub url: String,
    pub option: String,
    pub user: String,
    pub token: String,
    pub persistent_id: String,
}

impl From<&CompareRequest> for StreamParams {
    fn from(req: &CompareRequest) -> Self {
        Self {
            plugin_id: req.plugin_id.clone(),
            repo_name: req.repo_name.clone(),
            url: req.url.clone(),
            option: req.option.clone(),
            user: req.user.clone(),
            token: req.token.clone(),
            persistent_id: req.persistent_id.clone(),
        }
    }
}

/// Entry of a picker list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectItem {
    pub label: String,
    pub value: String,
    pub selected: bool,
}

impl SelectItem {
    pub fn new(label: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
            selected: false,
        }
    }
}

/// Lazily opened source bytes of one node.
///
/// # Preconditions
/// - `open` is called at most once
/// - `close` is called after the consumer is done, on success or failure
#[async_trait]
pub trait NodeStream: Send {
    async fn open(&mut self) -> Result<ByteStream>;

    /// Release backend resources. Calling it again is a no-op.
    async fn close(&mut self) -> Result<()>;
}

/// Work a plugin runs once after every node of a job was processed.
#[async_trait]
pub trait Cleanup: Send {
    /// Returns a transfer task id when the transfer continues out of band.
    async fn run(&mut self) -> Result<Option<String>>;
}

/// Streams for the nodes of one job.
#[derive(Default)]
pub struct StreamSet {
    pub streams: HashMap<String, Box<dyn NodeStream>>,
    pub cleanup: Option<Box<dyn Cleanup>>,
}

impl StreamSet {
    /// Deferred transfers carry no per-node streams, only a cleanup that
    /// moves the bytes out of band.
    pub fn is_deferred(&self) -> bool {
        self.streams.is_empty() && self.cleanup.is_some()
    }
}

/// Error returned by capabilities a plugin does not implement.
pub fn unsupported(plugin: &str, capability: &str) -> Error {
    Error::Unsupported(format!("plugin '{}' does not support {}", plugin, capability))
}

/// Source backend.
///
/// Every capability is optional; the default implementations report
/// [`Error::Unsupported`]. Dropping a returned future cancels the call.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Backend identifier (e.g. "local", "github").
    fn id(&self) -> &str;

    /// List every file at the chosen location.
    ///
    /// Files the destination does not have yet may carry the hash
    /// [`NOT_NEEDED`](rdmsync_common::NOT_NEEDED) instead of a computed one.
    async fn query(&self, _req: &CompareRequest, _destination: &NodeMap) -> Result<NodeMap> {
        Err(unsupported(self.id(), "query"))
    }

    /// Enumerate sub-locations for the picker.
    async fn options(&self, _req: &OptionsRequest) -> Result<Vec<SelectItem>> {
        Err(unsupported(self.id(), "options"))
    }

    /// Free-text lookup of top-level locations.
    async fn search(&self, _req: &OptionsRequest) -> Result<Vec<SelectItem>> {
        Err(unsupported(self.id(), "search"))
    }

    /// One stream per Copy/Update node in `nodes`.
    async fn streams(&self, _nodes: &NodeMap, _params: &StreamParams) -> Result<StreamSet> {
        Err(unsupported(self.id(), "streams"))
    }
}

/// Stand-in for identifiers nothing is registered under.
pub struct UnsupportedPlugin {
    id: String,
}

impl UnsupportedPlugin {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }
}

#[async_trait]
impl Plugin for UnsupportedPlugin {
    fn id(&self) -> &str {
        &self.id
    }
}
