//! Plugin registry resolved once at startup.

use std::collections::HashMap;
use std::sync::Arc;

use rdmsync_common::{Error, Result};

use crate::local::LocalPlugin;
use crate::memory::MemoryPlugin;
use crate::plugin::{Plugin, UnsupportedPlugin};

/// Maps backend identifiers to plugin implementations.
pub struct PluginRegistry {
    plugins: HashMap<String, Arc<dyn Plugin>>,
}

impl PluginRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            plugins: HashMap::new(),
        }
    }

    /// Register a plugin under its own id.
    ///
    /// # Errors
    /// - Returns error if the id is already registered
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<()> {
        let id = plugin.id().to_string();
        if self.plugins.contains_key(&id) {
            return Err(Error::AlreadyExists(format!(
                "Plugin '{}' is already registered",
                id
            )));
        }
        self.plugins.insert(id, plugin);
        Ok(())
    }

    /// Look up a plugin.
    ///
    /// Unknown ids yield a plugin without capabilities, so the caller gets
    /// an `Unsupported` error from whichever capability it tries.
    pub fn get(&self, id: &str) -> Arc<dyn Plugin> {
        self.plugins
            .get(id)
            .cloned()
            .unwrap_or_else(|| Arc::new(UnsupportedPlugin::new(id)))
    }

    /// Get list of registered plugin ids.
    pub fn plugins(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.plugins.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Check if a plugin is registered.
    pub fn has_plugin(&self, id: &str) -> bool {
        self.plugins.contains_key(id)
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the built-in plugins.
pub fn create_default_registry() -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    let builtins: [Arc<dyn Plugin>; 2] = [
        Arc::new(LocalPlugin::new()),
        Arc::new(MemoryPlugin::new("memory")),
    ];
    for plugin in builtins {
        registry.plugins.insert(plugin.id().to_string(), plugin);
    }
    registry
}
