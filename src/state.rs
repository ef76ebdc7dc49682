use crate::config::Config;
use crate::database::Provider;
use crate::engine::Engine;
use crate::health::HealthChecker;
use crate::storage::ImageStorage;
use crate::worker::WorkerPool;
use std::sync::Arc;

/// Application state shared across handlers
pub struct AppState {
    pub engine: Arc<Engine>,
    pub worker_pool: WorkerPool,
    pub database: Arc<dyn Provider>,
    pub storage: ImageStorage,
    pub health: HealthChecker,
    pub config: Arc<Config>,
}
