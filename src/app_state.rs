// =============================================================================
// Application State — explicitly constructed service container
// =============================================================================
//
// Built once in `main` and handed to the router as `Arc<AppState>`. There are
// no process-wide singletons: the tick bus and connection manager live here
// and nowhere else.
// =============================================================================

use std::sync::Arc;
use std::time::Instant;

use crate::market_data::TickBus;
use crate::runtime_config::ServerConfig;
use crate::streaming::ConnectionManager;

pub struct AppState {
    pub config: ServerConfig,
    pub manager: Arc<ConnectionManager>,
    started_at: Instant,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        let bus = Arc::new(TickBus::from_config(&config));
        let manager = Arc::new(ConnectionManager::new(config.clone(), bus));
        Self {
            config,
            manager,
            started_at: Instant::now(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
