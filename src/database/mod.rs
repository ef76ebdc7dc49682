//! Photo metadata providers

mod file;

pub use file::FileProvider;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A photo record as stored by a provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Photo {
    pub id: String,
    pub author: String,
    pub width: u32,
    pub height: u32,
    /// Link to the original source of the photo
    pub url: String,
}

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("Image does not exist")]
    NotFound,

    #[error("Failed to read metadata: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse metadata: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Metadata store unavailable: {0}")]
    Unavailable(String),
}

/// Source of photo metadata.
///
/// Implementations must be cheap to call from async handlers; the health
/// checker runs [`Provider::health_check`] on a blocking thread.
pub trait Provider: Send + Sync {
    fn get(&self, id: &str) -> Result<Photo, DatabaseError>;

    /// Pick a photo deterministically from `seed`.
    fn random(&self, seed: u64) -> Result<Photo, DatabaseError>;

    /// One page of photos, `page` starting at 1.
    fn list(&self, page: usize, limit: usize) -> Result<Vec<Photo>, DatabaseError>;

    fn health_check(&self) -> Result<(), DatabaseError>;
}
