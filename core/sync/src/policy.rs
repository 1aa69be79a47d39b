//! Destination naming and size rules applied to source listings.

use regex::Regex;
use tracing::debug;

use rdmsync_common::{Error, Result};
use rdmsync_tree::NodeMap;

const FILE_NAME_PATTERN: &str = r#"^[^:<>;#"/|?*\\]*$"#;
const FOLDER_PATH_PATTERN: &str = r"^[A-Za-z0-9_. /\\-]*$";

const FILE_NAME_RULE: &str = "Cannot contain any of: :, <, >, ;, #, \", /, |, ?, *, \\";
const FOLDER_PATH_RULE: &str = "Allowed characters: letters, digits, spaces, underscores (_), \
hyphens (-), dots (.), forward slashes (/), or backslashes (\\). \
Must not start with \".\", \"-\", or \"/\".";

/// Files the policy kept out of a listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Rejections {
    /// Ids of files larger than the limit.
    pub size: Vec<String>,
    /// Ids of files with a name or folder the destination refuses.
    pub name: Vec<String>,
}

/// What the destination accepts.
#[derive(Debug, Clone)]
pub struct Policy {
    file_name: Regex,
    folder_path: Regex,
    max_file_size: u64,
}

impl Policy {
    /// `max_file_size` of 0 means unlimited.
    pub fn new(max_file_size: u64) -> Result<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| Error::InvalidInput(format!("bad pattern: {}", e)))
        };
        Ok(Self {
            file_name: compile(FILE_NAME_PATTERN)?,
            folder_path: compile(FOLDER_PATH_PATTERN)?,
            max_file_size,
        })
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// Human-readable file name rule.
    pub fn file_name_rule(&self) -> &'static str {
        FILE_NAME_RULE
    }

    /// Human-readable folder path rule.
    pub fn folder_path_rule(&self) -> &'static str {
        FOLDER_PATH_RULE
    }

    /// Hidden files (leading dot) are refused along with forbidden characters.
    pub fn file_name_allowed(&self, name: &str) -> bool {
        !name.starts_with('.') && self.file_name.is_match(name)
    }

    pub fn folder_path_allowed(&self, path: &str) -> bool {
        if path.is_empty() {
            return true;
        }
        if path.starts_with(|c: char| matches!(c, '.' | '-' | '/')) {
            return false;
        }
        if path.split('/').any(|segment| segment.starts_with('.')) {
            return false;
        }
        self.folder_path.is_match(path)
    }

    /// Remove refused files from a source listing.
    ///
    /// Files with an empty or blank name are dropped without being reported.
    /// Rejected ids come back sorted.
    pub fn apply(&self, nodes: &mut NodeMap) -> Rejections {
        let mut rejections = Rejections::default();
        nodes.retain(|id, node| {
            if !node.is_file {
                return true;
            }
            if node.name.trim().is_empty() {
                debug!("Dropping nameless entry {:?}", id);
                return false;
            }
            if self.max_file_size > 0 && node.remote_file_size > self.max_file_size {
                rejections.size.push(id.clone());
                return false;
            }
            if !self.file_name_allowed(&node.name) || !self.folder_path_allowed(&node.path) {
                rejections.name.push(id.clone());
                return false;
            }
            true
        });
        rejections.size.sort();
        rejections.name.sort();
        rejections
    }
}
