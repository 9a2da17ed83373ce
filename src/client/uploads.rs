//! In-flight upload set
//!
//! Uploads are spawned as soon as they are registered and run in the
//! background. Nothing waits on them until [`InFlightUploads::settle_all`],
//! which is the single synchronization point at the end of a run.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::errors::ClientError;

/// Result of one upload, tagged with its hash
type UploadOutcome = (String, Result<(), ClientError>);

/// How the registered uploads ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub succeeded: usize,
    pub failed: usize,
}

impl DrainSummary {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }
}

/// Uploads that have been started but not yet awaited
pub struct InFlightUploads {
    /// Running upload tasks
    tasks: Mutex<JoinSet<UploadOutcome>>,
    /// Bounds how many uploads stream at once
    limit: Arc<Semaphore>,
}

impl InFlightUploads {
    /// Create an empty set
    ///
    /// # Arguments
    /// * `max_concurrent` - Uploads allowed to run at the same time; extra
    ///   registrations wait inside their task, not in the caller
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            tasks: Mutex::new(JoinSet::new()),
            limit: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Start an upload in the background
    ///
    /// Returns immediately. The upload runs once a concurrency slot is free.
    /// Must be called from within a Tokio runtime.
    pub fn register<F>(&self, hash: &str, upload: F)
    where
        F: Future<Output = Result<(), ClientError>> + Send + 'static,
    {
        let hash = hash.to_string();
        let limit = Arc::clone(&self.limit);

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.spawn(async move {
            let result = match limit.acquire_owned().await {
                Ok(_permit) => upload.await,
                Err(_) => Err(ClientError::Request("upload limiter closed".to_string())),
            };
            (hash, result)
        });
        debug!(in_flight = tasks.len(), "Registered upload");
    }

    /// Number of uploads not yet settled by [`InFlightUploads::settle_all`]
    pub fn len(&self) -> usize {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until every registered upload has finished, one way or another
    ///
    /// Failures are logged and counted, never returned. Uploads registered
    /// while this runs are left for the next call.
    pub async fn settle_all(&self) -> DrainSummary {
        let mut tasks = {
            let mut guard = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        let mut summary = DrainSummary::default();

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((hash, Ok(()))) => {
                    debug!(hash = %hash, "Upload finished");
                    summary.succeeded += 1;
                }
                Ok((hash, Err(e))) => {
                    debug!(hash = %hash, error = %e, "Upload failed");
                    summary.failed += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Upload task panicked");
                    summary.failed += 1;
                }
            }
        }

        summary
    }
}
