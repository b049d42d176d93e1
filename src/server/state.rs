use std::sync::Arc;

use crate::config::ConfigStore;
use crate::db::{DbPool, Repository};
use crate::events::EventBus;
use crate::metrics::Metrics;
use crate::stream::SessionManager;

/// Application state for the HTTP server.
///
/// Holds the shared resources request handlers need: the repository, the
/// typed configuration, the session manager, the event bus, and metrics.
#[derive(Clone)]
pub struct AppState {
    pool: DbPool,
    pub repo: Repository,
    pub config: Arc<ConfigStore>,
    pub sessions: Arc<SessionManager>,
    pub events: EventBus,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(
        pool: DbPool,
        repo: Repository,
        config: Arc<ConfigStore>,
        sessions: Arc<SessionManager>,
        events: EventBus,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            pool,
            repo,
            config,
            sessions,
            events,
            metrics,
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    /// Configured HTTP listen port.
    pub fn streaming_port(&self) -> u16 {
        self.config.get().streaming_port
    }
}
