//! Project existence cache
//!
//! Every upload checks that its project exists. Positive answers are cached
//! for a short while; negative ones are not, so a freshly created project
//! is usable right away.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use moka::sync::Cache;
use tracing::trace;

use crate::index::{ArtifactIndex, IndexError};

/// How long a known project is trusted without asking the index again
pub const DEFAULT_PROJECT_TTL: Duration = Duration::from_secs(60);

/// Upper bound on cached project ids
const MAX_CACHED_PROJECTS: u64 = 10_000;

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: u64,
}

/// Caches which project ids exist
pub struct ProjectCache {
    known: Cache<String, ()>,
    /// Cache hit counter
    hits: AtomicU64,
    /// Cache miss counter
    misses: AtomicU64,
}

impl ProjectCache {
    /// Create a cache with the default TTL
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_PROJECT_TTL)
    }

    /// Create a cache with a custom TTL
    pub fn with_ttl(ttl: Duration) -> Self {
        let known = Cache::builder()
            .max_capacity(MAX_CACHED_PROJECTS)
            .time_to_live(ttl)
            .name("project_exists_cache")
            .build();

        Self {
            known,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Whether `project_id` exists, asking the index on a miss
    pub async fn exists(&self, index: &ArtifactIndex, project_id: &str) -> Result<bool, IndexError> {
        if self.known.contains_key(project_id) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            trace!(project_id = project_id, "Cache HIT for project");
            return Ok(true);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        trace!(project_id = project_id, "Cache MISS for project");

        let exists = index.project_exists(project_id).await?;
        if exists {
            self.known.insert(project_id.to_string(), ());
        }
        Ok(exists)
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.known.entry_count(),
        }
    }
}

impl Default for ProjectCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn index() -> (TempDir, ArtifactIndex) {
        let temp = TempDir::new().unwrap();
        let index = ArtifactIndex::open(&temp.path().join("index.sqlite"))
            .await
            .unwrap();
        (temp, index)
    }

    #[tokio::test]
    async fn test_positive_lookups_are_cached() {
        let (_temp, index) = index().await;
        index.create_project_with_id("p1", "web").await.unwrap();
        let cache = ProjectCache::new();

        assert!(cache.exists(&index, "p1").await.unwrap());
        assert!(cache.exists(&index, "p1").await.unwrap());

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn test_negative_lookups_are_not_cached() {
        let (_temp, index) = index().await;
        let cache = ProjectCache::new();

        assert!(!cache.exists(&index, "p1").await.unwrap());
        index.create_project_with_id("p1", "web").await.unwrap();
        assert!(cache.exists(&index, "p1").await.unwrap());
        assert_eq!(cache.stats().hits, 0);
    }
}
