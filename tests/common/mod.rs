//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::Arc;

use nx_local_cache::index::ArtifactIndex;
use nx_local_cache::server::{router, AppState};
use nx_local_cache::store::DiskObjectStore;
use tempfile::TempDir;
use tokio::net::TcpListener;

/// Project every test server knows about
pub const PROJECT_ID: &str = "p1";

/// A cache server running on an ephemeral port
pub struct TestServer {
    /// Keeps the index and objects alive for the duration of the test
    pub data: TempDir,
    pub state: AppState,
    /// e.g. `http://127.0.0.1:41234`
    pub base_url: String,
}

impl TestServer {
    pub async fn start() -> Self {
        let data = TempDir::new().unwrap();
        let index = ArtifactIndex::open(&data.path().join("index.sqlite"))
            .await
            .unwrap();
        index.create_project_with_id(PROJECT_ID, "demo").await.unwrap();
        let store = DiskObjectStore::new(data.path().join("objects")).unwrap();
        let state = AppState::new(index, Arc::new(store));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            data,
            state,
            base_url: format!("http://{addr}"),
        }
    }

    /// Project-scoped address the cache adapter is configured with
    pub fn project_host(&self) -> String {
        format!("{}/projects/{}", self.base_url, PROJECT_ID)
    }

    pub fn cache_url(&self, hash: &str) -> String {
        format!("{}/cache/{}", self.project_host(), hash)
    }

    pub fn index(&self) -> &ArtifactIndex {
        &self.state.index
    }
}
