//! Picsum - on-demand photo transformation service
//!
//! Serves resized, grayscaled and blurred photos from a local library, and
//! transforms uploaded images, on a dedicated native image engine.

mod config;
mod database;
mod encoder;
mod engine;
mod error;
mod handle;
mod handlers;
mod health;
mod pipeline;
mod router;
mod shutdown;
mod state;
mod storage;
mod worker;

#[cfg(test)]
mod test_support;

use crate::config::Config;
use crate::database::{FileProvider, Provider};
use crate::engine::{Engine, EngineOptions};
use crate::health::HealthChecker;
use crate::router::create_router;
use crate::shutdown::{shutdown_signal, ShutdownCoordinator};
use crate::state::AppState;
use crate::storage::ImageStorage;
use crate::worker::WorkerPool;

use std::future::IntoFuture;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, info_span, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "picsum=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting picsum...");

    // Load configuration
    let config = Arc::new(Config::from_env());
    info!("Configuration loaded: {:?}", config);

    // Bring up the image engine
    let engine = Arc::new(Engine::new(EngineOptions::from(config.as_ref())));
    if let Err(e) = engine.initialize(info_span!("engine")) {
        error!(error = %e, "Failed to initialize image engine");
        return ExitCode::FAILURE;
    }
    info!(workers = config.worker_count, "Image engine initialized");

    // Open the metadata store
    let database: Arc<dyn Provider> = match FileProvider::open(&config.database_file_path) {
        Ok(provider) => {
            if provider.is_empty() {
                warn!(path = ?config.database_file_path, "Metadata store has no photos");
            }
            Arc::new(provider)
        }
        Err(e) => {
            error!(error = %e, path = ?config.database_file_path, "Failed to open metadata store");
            shutdown_engine(&engine);
            return ExitCode::FAILURE;
        }
    };

    let coordinator = ShutdownCoordinator::new(config.drain_timeout());

    // Background health checks
    let health = HealthChecker::new(database.clone())
        .with_check_interval(config.health_check_interval())
        .with_check_timeout(config.health_check_timeout());
    let health_task = tokio::spawn(health.clone().run(coordinator.health_token()));

    // Create worker pool
    let worker_pool = WorkerPool::new(engine.clone(), &config);
    info!(queue_size = config.queue_size, "Worker pool initialized");

    // Create shared app state
    let app_state = Arc::new(AppState {
        engine: engine.clone(),
        worker_pool,
        database,
        storage: ImageStorage::new(&config.image_dir),
        health,
        config: config.clone(),
    });

    // Build router
    let app = create_router(app_state.clone());

    // Bind and serve
    let port = config.server_port;
    let listener = match tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, port, "Failed to bind to port");
            coordinator.health_token().cancel();
            let _ = health_task.await;
            shutdown_engine(&engine);
            return ExitCode::FAILURE;
        }
    };

    info!(port = port, "Server listening");

    let server = tokio::spawn(
        axum::serve(listener, app)
            .with_graceful_shutdown(coordinator.server_token().cancelled_owned())
            .into_future(),
    );

    let report = coordinator
        .run(server, shutdown_signal(), &app_state.worker_pool, &engine)
        .await;
    let _ = health_task.await;

    if report.is_clean() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn shutdown_engine(engine: &Engine) {
    if let Err(e) = engine.shutdown() {
        error!(error = %e, "Failed to shut down image engine");
    }
}
