//! Handles shared by the compare engine, the queue and the workers.

use std::sync::Arc;

use rdmsync_common::EngineConfig;
use rdmsync_destination::Destination;
use rdmsync_plugin::PluginRegistry;
use rdmsync_store::KeyValueStore;

/// Everything a sync component talks to. Cheap to clone.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn KeyValueStore>,
    pub destination: Arc<dyn Destination>,
    pub plugins: Arc<PluginRegistry>,
    pub config: Arc<EngineConfig>,
}

impl Services {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        destination: Arc<dyn Destination>,
        plugins: Arc<PluginRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            destination,
            plugins,
            config: Arc::new(config),
        }
    }
}
