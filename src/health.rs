//! Background health checking of the metadata store
//!
//! The checker probes [`Provider::health_check`] on a fixed interval and keeps
//! the latest result in shared state that the `/health` endpoint reads
//! without waiting on a probe.
//!
//! ```ignore
//! let checker = HealthChecker::new(database);
//! tokio::spawn(checker.clone().run(shutdown_token));
//! let status = checker.status();
//! ```

use crate::database::Provider;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default interval between probes (10 seconds).
pub const DEFAULT_CHECK_INTERVAL_SECS: u64 = 10;

/// Default deadline for a single probe (8 seconds).
pub const DEFAULT_CHECK_TIMEOUT_SECS: u64 = 8;

/// Latest observed health.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,
    /// When the last probe finished; `None` before the first one.
    pub checked_at: Option<DateTime<Utc>>,
    /// Why the store is considered unhealthy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cause: Option<String>,
}

impl Default for HealthStatus {
    fn default() -> Self {
        Self {
            healthy: false,
            checked_at: None,
            cause: Some("not checked yet".to_string()),
        }
    }
}

/// Periodic prober of the metadata store.
///
/// Clones share the same status.
#[derive(Clone)]
pub struct HealthChecker {
    database: Arc<dyn Provider>,
    status: Arc<RwLock<HealthStatus>>,
    check_interval: Duration,
    check_timeout: Duration,
}

impl HealthChecker {
    pub fn new(database: Arc<dyn Provider>) -> Self {
        Self {
            database,
            status: Arc::default(),
            check_interval: Duration::from_secs(DEFAULT_CHECK_INTERVAL_SECS),
            check_timeout: Duration::from_secs(DEFAULT_CHECK_TIMEOUT_SECS),
        }
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_check_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }

    /// The most recent status.
    pub fn status(&self) -> HealthStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Probe once and record the outcome.
    pub async fn check(&self) -> HealthStatus {
        let database = Arc::clone(&self.database);
        let probe = tokio::task::spawn_blocking(move || database.health_check());

        let cause = match tokio::time::timeout(self.check_timeout, probe).await {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(e))) => Some(e.to_string()),
            Ok(Err(e)) => Some(format!("health check aborted: {e}")),
            Err(_) => Some("health check timed out".to_string()),
        };

        let status = HealthStatus {
            healthy: cause.is_none(),
            checked_at: Some(Utc::now()),
            cause,
        };

        let previous = {
            let mut current = self.status.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, status.clone())
        };

        let first = previous.checked_at.is_none();
        if !status.healthy && (first || previous.healthy) {
            warn!(cause = ?status.cause, "Metadata store unhealthy");
        } else if status.healthy && !first && !previous.healthy {
            info!("Metadata store recovered");
        } else {
            debug!(healthy = status.healthy, "Health check complete");
        }

        status
    }

    /// Probe until `shutdown` fires. The first probe runs immediately.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            check_interval_secs = self.check_interval.as_secs(),
            "Health checker starting"
        );

        let mut interval = tokio::time::interval(self.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    info!("Health checker shutting down");
                    break;
                }

                _ = interval.tick() => {
                    self.check().await;
                }
            }
        }
    }
}
