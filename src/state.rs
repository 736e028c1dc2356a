//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::mux::hub::Hub;
use crate::sessions::SessionRegistry;
use crate::store::MetadataStore;

#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    /// Owns every terminal, chat and remote session.
    pub registry: SessionRegistry,
    /// Connection ↔ session subscriptions.
    pub hub: Hub,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn MetadataStore>) -> Self {
        let config = Arc::new(config);
        Self {
            registry: SessionRegistry::new(Arc::clone(&config), store),
            hub: Hub::new(config.output.queue_capacity),
            config,
            start_time: Instant::now(),
        }
    }
}
