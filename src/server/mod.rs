//! Cache server
//!
//! Serves the cache endpoint over HTTP. Artifact bodies go to an
//! [`ObjectStore`], their records to the [`ArtifactIndex`].

pub mod endpoint;
pub mod projects;

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::ServerConfig;
use crate::index::ArtifactIndex;
use crate::store::{DiskObjectStore, ObjectStore};

pub use projects::ProjectCache;

/// Default lifetime of a stored object
pub const DEFAULT_OBJECT_TTL_HOURS: i64 = 24 * 7;

/// Shared state of every request handler
#[derive(Clone)]
pub struct AppState {
    pub index: ArtifactIndex,
    pub store: Arc<dyn ObjectStore>,
    pub projects: Arc<ProjectCache>,
    /// How long after writing an object it may expire
    pub object_ttl: chrono::Duration,
}

impl AppState {
    pub fn new(index: ArtifactIndex, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            index,
            store,
            projects: Arc::new(ProjectCache::new()),
            object_ttl: chrono::Duration::hours(DEFAULT_OBJECT_TTL_HOURS),
        }
    }

    pub fn with_object_ttl(mut self, ttl: chrono::Duration) -> Self {
        self.object_ttl = ttl;
        self
    }
}

/// Build the HTTP router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/projects/{project_id}/cache/{hash}",
            get(endpoint::fetch_artifact)
                .post(endpoint::store_artifact)
                .fallback(endpoint::unsupported_method),
        )
        // Archive bodies are streamed; there is no size to cap them at
        .layer(DefaultBodyLimit::disable())
        .with_state(state)
}

/// Serve `state` on an already bound listener until `shutdown` resolves
pub async fn serve_with_shutdown<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().context("Failed to read listener address")?;
    info!(addr = %addr, "Cache server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Cache server failed")?;

    info!("Cache server stopped");
    Ok(())
}

/// Open storage as configured and serve until Ctrl-C
pub async fn serve(config: &ServerConfig) -> Result<()> {
    let index = ArtifactIndex::open(&config.database)
        .await
        .with_context(|| format!("Failed to open index at {}", config.database.display()))?;

    let objects_dir = config.objects_dir();
    let store = DiskObjectStore::new(objects_dir.clone())
        .with_context(|| format!("Failed to open object store at {}", objects_dir.display()))?;
    info!(root = %objects_dir.display(), "Object store ready");

    let state = AppState::new(index, Arc::new(store)).with_object_ttl(config.object_ttl);

    let listener = TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind))?;

    serve_with_shutdown(listener, state, shutdown_signal()).await
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => {
            warn!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}
