//! rdmsync plugin contract
//!
//! A plugin exposes one source backend through up to four capabilities:
//! - `query`: list files with their hashes
//! - `options` and `search`: picker lookups
//! - `streams`: per-node byte streams for a persist job
//!
//! Built-in implementations:
//! - Local filesystem
//! - Memory (testing)

pub mod local;
pub mod memory;
pub mod plugin;
pub mod registry;

pub use local::LocalPlugin;
pub use memory::MemoryPlugin;
pub use plugin::{
    unsupported, Cleanup, CompareRequest, NodeStream, OptionsRequest, Plugin, SelectItem,
    StreamParams, StreamSet, UnsupportedPlugin,
};
pub use registry::{create_default_registry, PluginRegistry};
