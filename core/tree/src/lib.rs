//! Node/tree model shared by both sides of a sync.
//!
//! A tree is kept flat: a [`NodeMap`] from slash-separated id to [`Node`].
//! Folders are never fetched, they are derived from file paths.

pub mod merge;
pub mod node;

pub use merge::{build_folders, merge, sorted};
pub use node::{split_id, Action, DestinationFile, Node, NodeMap, Status};
