//! Source image bytes on disk

use bytes::Bytes;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Image does not exist")]
    NotFound,

    #[error("Invalid image id: {0}")]
    InvalidId(String),

    #[error("Failed to read image: {0}")]
    Io(#[from] io::Error),
}

/// Reads `{dir}/{id}.jpg`.
#[derive(Debug, Clone)]
pub struct ImageStorage {
    dir: PathBuf,
}

impl ImageStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub async fn get(&self, id: &str) -> Result<Bytes, StorageError> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(StorageError::InvalidId(id.to_string()));
        }

        let path = self.dir.join(format!("{id}.jpg"));
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StorageError::NotFound),
            Err(e) => Err(StorageError::Io(e)),
        }
    }
}
