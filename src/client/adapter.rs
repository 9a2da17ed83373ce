//! Remote cache adapter
//!
//! The entry point the build orchestrator talks to. Every operation is
//! fail-soft: a cache problem only ever turns into `false` (and a debug log
//! line), so the worst outcome for the build is a local rebuild.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Body;
use tracing::debug;

use super::errors::ClientError;
use super::transport::{self, CacheTransport};
use super::uploads::{DrainSummary, InFlightUploads};
use crate::archive::{self, PackedArchive, PathFilter, ProvenanceFilter, UnpackSummary};
use crate::config::ClientConfig;
use crate::protocol::{commit_marker_name, is_valid_segment};
use crate::types::{find_task, Provenance, Task};

/// Operations the orchestrator needs from a remote cache
#[async_trait]
pub trait RemoteCache: Send + Sync {
    /// Materialize `hash` under `cache_directory`
    ///
    /// Returns `true` only if the artifact was fully extracted and its commit
    /// marker written. On `false` the `hash` subtree must not be trusted.
    async fn retrieve(&self, hash: &str, cache_directory: &Path) -> bool;

    /// Start uploading the `hash` subtree of `cache_directory`
    ///
    /// Returns once the upload is dispatched, without waiting for the
    /// network. `false` means the archive could not be prepared.
    async fn store(&self, hash: &str, cache_directory: &Path) -> bool;

    /// Wait for every upload started by [`RemoteCache::store`] to settle
    async fn drain(&self);
}

/// Remote cache backed by the HTTP cache endpoint
pub struct HttpRemoteCache {
    transport: CacheTransport,
    /// Tasks of the current run, used for provenance headers
    tasks: Vec<Task>,
    filter: Arc<dyn PathFilter>,
    uploads: InFlightUploads,
}

impl HttpRemoteCache {
    /// Create an adapter over an existing transport
    ///
    /// # Arguments
    /// * `transport` - Client bound to the project-scoped cache address
    /// * `tasks` - Tasks of this run; hashes without a task upload without provenance
    /// * `parallel` - Uploads allowed to stream at once
    pub fn new(transport: CacheTransport, tasks: Vec<Task>, parallel: usize) -> Self {
        Self {
            transport,
            tasks,
            filter: Arc::new(ProvenanceFilter),
            uploads: InFlightUploads::new(parallel),
        }
    }

    /// Create an adapter from client configuration
    pub fn from_config(config: &ClientConfig, tasks: Vec<Task>) -> Result<Self, ClientError> {
        let transport = CacheTransport::new(&config.host, config.timeout)?;
        Ok(Self::new(transport, tasks, config.parallel))
    }

    /// Uploads registered and not yet drained
    pub fn pending_uploads(&self) -> usize {
        self.uploads.len()
    }

    /// Like [`RemoteCache::drain`], but reports how the uploads ended
    pub async fn drain_with_summary(&self) -> DrainSummary {
        let summary = self.uploads.settle_all().await;
        debug!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Drained remote cache uploads"
        );
        summary
    }

    async fn try_retrieve(
        &self,
        hash: &str,
        cache_directory: &Path,
    ) -> Result<UnpackSummary, ClientError> {
        validate_hash(hash)?;
        let response = self.transport.fetch(hash).await?;

        // A marker left by an earlier extraction no longer vouches for what follows
        let marker = cache_directory.join(commit_marker_name(hash));
        match tokio::fs::remove_file(&marker).await {
            Ok(()) => debug!(marker = %marker.display(), "Removed stale commit marker"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let summary = archive::unpack(
            transport::body_stream(response),
            cache_directory,
            Arc::clone(&self.filter),
        )
        .await?;

        write_commit_marker(cache_directory, marker).await?;
        Ok(summary)
    }

    async fn plan_archive(
        &self,
        hash: &str,
        cache_directory: &Path,
    ) -> Result<PackedArchive, ClientError> {
        validate_hash(hash)?;
        let source = cache_directory.to_path_buf();
        let root = PathBuf::from(hash);
        let filter = Arc::clone(&self.filter);

        let archive = tokio::task::spawn_blocking(move || {
            PackedArchive::plan(&source, &[root], filter.as_ref())
        })
        .await
        .map_err(|e| archive::ArchiveError::Interrupted(e.to_string()))??;
        Ok(archive)
    }
}

#[async_trait]
impl RemoteCache for HttpRemoteCache {
    async fn retrieve(&self, hash: &str, cache_directory: &Path) -> bool {
        match self.try_retrieve(hash, cache_directory).await {
            Ok(summary) => {
                debug!(
                    hash = hash,
                    extracted = summary.extracted,
                    skipped = summary.skipped,
                    "Retrieved artifact from remote cache"
                );
                true
            }
            Err(ClientError::NotFound(_)) => {
                debug!(hash = hash, "Remote cache miss");
                false
            }
            Err(e) => {
                debug!(hash = hash, error = %e, "Remote cache retrieve failed");
                false
            }
        }
    }

    async fn store(&self, hash: &str, cache_directory: &Path) -> bool {
        let archive = match self.plan_archive(hash, cache_directory).await {
            Ok(archive) => archive,
            Err(e) => {
                debug!(hash = hash, error = %e, "Could not prepare artifact for upload");
                return false;
            }
        };

        let provenance = Provenance::from_task(find_task(&self.tasks, hash));
        let transport = self.transport.clone();
        let owned_hash = hash.to_string();
        debug!(hash = hash, entries = archive.len(), "Dispatching upload");

        self.uploads.register(hash, async move {
            let body = Body::wrap_stream(archive.into_stream());
            transport.upload(&owned_hash, body, &provenance).await
        });
        true
    }

    async fn drain(&self) {
        self.drain_with_summary().await;
    }
}

fn validate_hash(hash: &str) -> Result<(), ClientError> {
    if is_valid_segment(hash) {
        Ok(())
    } else {
        Err(ClientError::InvalidHash(hash.to_string()))
    }
}

/// Create the commit marker atomically, after the subtree is complete
async fn write_commit_marker(cache_directory: &Path, marker: PathBuf) -> Result<(), ClientError> {
    let directory = cache_directory.to_path_buf();
    tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        let temp = tempfile::NamedTempFile::new_in(&directory)?;
        temp.persist(&marker).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| archive::ArchiveError::Interrupted(e.to_string()))??;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn unreachable_cache() -> HttpRemoteCache {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let transport =
            CacheTransport::new(&format!("http://127.0.0.1:{port}"), Duration::from_secs(5))
                .unwrap()
                .with_max_retries(0);
        HttpRemoteCache::new(transport, Vec::new(), 2)
    }

    #[tokio::test]
    async fn test_retrieve_rejects_invalid_hash() {
        let cache = unreachable_cache();
        let dir = TempDir::new().unwrap();
        assert!(!cache.retrieve("../escape", dir.path()).await);
        assert!(!cache.retrieve("", dir.path()).await);
    }

    #[tokio::test]
    async fn test_retrieve_unreachable_server() {
        let cache = unreachable_cache();
        let dir = TempDir::new().unwrap();
        assert!(!cache.retrieve("abc123", dir.path()).await);
        assert!(!dir.path().join("abc123.commit").exists());
    }

    #[tokio::test]
    async fn test_store_missing_directory() {
        let cache = unreachable_cache();
        let dir = TempDir::new().unwrap();
        assert!(!cache.store("abc123", dir.path()).await);
        assert_eq!(cache.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn test_store_failure_settles_on_drain() {
        let cache = unreachable_cache();
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("abc123")).unwrap();
        std::fs::write(dir.path().join("abc123/out.txt"), b"hello").unwrap();

        assert!(cache.store("abc123", dir.path()).await);
        let summary = cache.drain_with_summary().await;
        assert_eq!(summary, DrainSummary { succeeded: 0, failed: 1 });
        assert_eq!(cache.pending_uploads(), 0);
    }

    #[tokio::test]
    async fn test_commit_marker_written() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join(commit_marker_name("abc123"));
        write_commit_marker(dir.path(), marker.clone()).await.unwrap();
        assert!(marker.exists());
        // No temp files left behind
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
