use chrono::{DateTime, Duration, Utc};
use lambda_build_models::BuildError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use tracing::{info, instrument};

const CACHE_FILE: &str = "build_cache.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedImage {
    pub image_id: String,
    pub built_at: DateTime<Utc>,
}

/// Maps recipe digests to previously built images.
pub struct BuildCache {
    cache_dir: PathBuf,
    images: HashMap<String, CachedImage>,
}

impl BuildCache {
    pub fn new(cache_dir: PathBuf) -> Result<Self, BuildError> {
        fs::create_dir_all(&cache_dir).map_err(|e| BuildError::InternalError {
            reason: format!("cannot create cache dir {}: {e}", cache_dir.display()),
        })?;

        let mut cache = Self {
            cache_dir,
            images: HashMap::new(),
        };
        cache.load_cache()?;
        Ok(cache)
    }

    #[instrument(skip(self))]
    pub fn get(&self, recipe_digest: &str) -> Option<&CachedImage> {
        self.images.get(recipe_digest)
    }

    #[instrument(skip(self))]
    pub fn insert(&mut self, recipe_digest: &str, image_id: String) {
        self.images.insert(
            recipe_digest.to_string(),
            CachedImage {
                image_id,
                built_at: Utc::now(),
            },
        );
        info!("Cached image for recipe digest: {}", recipe_digest);
    }

    pub fn invalidate(&mut self, recipe_digest: &str) -> Option<CachedImage> {
        self.images.remove(recipe_digest)
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    /// Drops entries older than `max_age_days`.
    #[instrument(skip(self))]
    pub fn cleanup_old_entries(&mut self, max_age_days: i64) -> usize {
        let cutoff = Utc::now() - Duration::days(max_age_days);
        let before = self.images.len();
        self.images.retain(|_, image| image.built_at >= cutoff);
        let removed = before - self.images.len();
        info!("Cleaned up {} old cache entries", removed);
        removed
    }

    fn load_cache(&mut self) -> Result<(), BuildError> {
        let cache_file = self.cache_dir.join(CACHE_FILE);
        if cache_file.exists() {
            let cache_data = fs::read_to_string(&cache_file)?;
            self.images = serde_json::from_str(&cache_data).map_err(|e| BuildError::InternalError {
                reason: format!("corrupt build cache {}: {e}", cache_file.display()),
            })?;
        }
        Ok(())
    }

    pub fn save_cache(&self) -> Result<(), BuildError> {
        let cache_file = self.cache_dir.join(CACHE_FILE);
        let cache_data = serde_json::to_string_pretty(&self.images).map_err(|e| {
            BuildError::InternalError {
                reason: e.to_string(),
            }
        })?;
        fs::write(&cache_file, cache_data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_persists() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut cache = BuildCache::new(dir.path().to_path_buf()).unwrap();
            assert!(cache.is_empty());
            cache.insert("d1", "sha256:img".into());
            cache.save_cache().unwrap();
        }
        let cache = BuildCache::new(dir.path().to_path_buf()).unwrap();
        let hit = cache.get("d1").unwrap();
        assert_eq!(hit.image_id, "sha256:img");
        assert!(cache.get("d2").is_none());
    }

    #[test]
    fn test_cleanup_and_invalidate() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = BuildCache::new(dir.path().to_path_buf()).unwrap();
        cache.insert("fresh", "a".into());
        cache.insert("stale", "b".into());
        if let Some(entry) = cache.images.get_mut("stale") {
            entry.built_at = Utc::now() - Duration::days(30);
        }

        assert_eq!(cache.cleanup_old_entries(7), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.invalidate("fresh").is_some());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_corrupt_cache_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CACHE_FILE), "not json").unwrap();
        assert!(BuildCache::new(dir.path().to_path_buf()).is_err());
    }
}
