//! Provider backed by a JSON metadata file

use super::{DatabaseError, Photo, Provider};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Loads every record at startup and serves them from memory in file order.
#[derive(Debug)]
pub struct FileProvider {
    path: PathBuf,
    photos: Vec<Photo>,
    index: HashMap<String, usize>,
}

impl FileProvider {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref().to_path_buf();
        let data = std::fs::read(&path)?;
        let photos: Vec<Photo> = serde_json::from_slice(&data)?;

        let index = photos
            .iter()
            .enumerate()
            .map(|(i, photo)| (photo.id.clone(), i))
            .collect();

        info!(path = ?path, photos = photos.len(), "Loaded photo metadata");

        Ok(Self { path, photos, index })
    }

    pub fn is_empty(&self) -> bool {
        self.photos.is_empty()
    }
}

impl Provider for FileProvider {
    fn get(&self, id: &str) -> Result<Photo, DatabaseError> {
        self.index
            .get(id)
            .map(|&i| self.photos[i].clone())
            .ok_or(DatabaseError::NotFound)
    }

    fn random(&self, seed: u64) -> Result<Photo, DatabaseError> {
        if self.photos.is_empty() {
            return Err(DatabaseError::NotFound);
        }
        let i = (seed % self.photos.len() as u64) as usize;
        Ok(self.photos[i].clone())
    }

    fn list(&self, page: usize, limit: usize) -> Result<Vec<Photo>, DatabaseError> {
        let offset = page.saturating_sub(1).saturating_mul(limit);
        Ok(self
            .photos
            .iter()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    fn health_check(&self) -> Result<(), DatabaseError> {
        std::fs::metadata(&self.path)
            .map_err(|e| DatabaseError::Unavailable(format!("{}: {e}", self.path.display())))?;

        if self.photos.is_empty() {
            return Err(DatabaseError::Unavailable("no photos loaded".to_string()));
        }

        Ok(())
    }
}
