//! Configuration management
//!
//! Includes smart CPU detection for optimal resource utilization.

use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Server port
    pub server_port: u16,
    /// Base URL used when building download links
    pub image_service_url: String,
    /// Path to the JSON photo metadata file
    pub database_file_path: PathBuf,
    /// Directory holding `{id}.jpg` source images
    pub image_dir: PathBuf,
    /// Directory served as the static fallback
    pub static_dir: PathBuf,
    /// Maximum upload size allowed in bytes
    pub max_file_size: usize,
    /// Maximum decoded resolution (width or height)
    pub max_resolution: u32,
    /// Maximum requested output width or height
    pub max_output_dimension: u32,
    /// JPEG quality (1-100)
    pub jpeg_quality: u8,
    /// Number of engine worker threads
    pub worker_count: usize,
    /// Maximum pending jobs in queue
    pub queue_size: usize,
    /// Deadline for one decode/transform/encode chain, in seconds
    pub handler_timeout_secs: u64,
    /// Deadline for writing a whole response, in seconds
    pub write_timeout_secs: u64,
    /// How long shutdown waits for in-flight requests, in seconds
    pub drain_timeout_secs: u64,
    /// Interval between metadata store probes, in seconds
    pub health_check_interval_secs: u64,
    /// Deadline for a single probe, in seconds
    pub health_check_timeout_secs: u64,
}

/// Smart CPU detection for optimal worker configuration
///
/// Strategy:
/// - Detects available parallelism (logical cores)
/// - For CPU-bound image processing, using all logical cores is beneficial
/// - Reserves 1 core for I/O tasks if we have more than 4 cores
/// - Ensures minimum of 2 workers and maximum based on available parallelism
fn detect_optimal_workers() -> usize {
    let logical_cores = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4);

    let workers = if logical_cores > 4 {
        logical_cores - 1 // Reserve one for I/O
    } else {
        logical_cores
    };

    workers.max(2)
}

/// Calculate optimal queue size based on worker count
///
/// Queue absorbs bursts without holding too many pending uploads in memory:
/// workers * 4, minimum 100.
fn calculate_optimal_queue_size(worker_count: usize) -> usize {
    let base_queue = worker_count * 4;
    base_queue.max(100)
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Default for Config {
    fn default() -> Self {
        let worker_count = detect_optimal_workers();

        Self {
            server_port: 8080,
            image_service_url: "http://localhost:8080".to_string(),
            database_file_path: PathBuf::from("./data/metadata.json"),
            image_dir: PathBuf::from("./data/images"),
            static_dir: PathBuf::from("static"),
            max_file_size: 50 * 1024 * 1024, // 50MB
            max_resolution: crate::encoder::WEBP_MAX_DIMENSION,
            max_output_dimension: 5000,
            jpeg_quality: 80,
            worker_count,
            queue_size: calculate_optimal_queue_size(worker_count),
            handler_timeout_secs: 19,
            write_timeout_secs: 20,
            drain_timeout_secs: 20,
            health_check_interval_secs: 10,
            health_check_timeout_secs: 8,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        dotenv().ok(); // Load .env if present

        let defaults = Self::default();

        let worker_count = env_or("WORKER_COUNT", defaults.worker_count).max(1);

        // Queue size follows the worker count unless overridden
        let default_queue = calculate_optimal_queue_size(worker_count);

        Self {
            server_port: env_or("SERVER_PORT", defaults.server_port),
            image_service_url: env::var("IMAGE_SERVICE_URL")
                .map(|url| url.trim_end_matches('/').to_string())
                .unwrap_or(defaults.image_service_url),
            database_file_path: env::var("DATABASE_FILE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.database_file_path),
            image_dir: env::var("IMAGE_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.image_dir),
            static_dir: env::var("STATIC_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.static_dir),
            max_file_size: env_or("MAX_FILE_SIZE", defaults.max_file_size),
            max_resolution: env_or("MAX_RESOLUTION", defaults.max_resolution),
            max_output_dimension: env_or("MAX_OUTPUT_DIMENSION", defaults.max_output_dimension),
            jpeg_quality: env_or("JPEG_QUALITY", defaults.jpeg_quality).clamp(1, 100),
            worker_count,
            queue_size: env_or("QUEUE_SIZE", default_queue).max(1),
            handler_timeout_secs: env_or("HANDLER_TIMEOUT_SECS", defaults.handler_timeout_secs),
            write_timeout_secs: env_or("WRITE_TIMEOUT_SECS", defaults.write_timeout_secs),
            drain_timeout_secs: env_or("DRAIN_TIMEOUT_SECS", defaults.drain_timeout_secs),
            health_check_interval_secs: env_or(
                "HEALTH_CHECK_INTERVAL_SECS",
                defaults.health_check_interval_secs,
            )
            .max(1),
            health_check_timeout_secs: env_or(
                "HEALTH_CHECK_TIMEOUT_SECS",
                defaults.health_check_timeout_secs,
            ),
        }
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_secs(self.handler_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_secs(self.health_check_timeout_secs)
    }
}
