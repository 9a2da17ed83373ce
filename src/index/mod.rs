//! Artifact index
//!
//! Relational record of stored artifacts, keyed by (hash, project id). The
//! index is the single source of truth for whether an artifact is cached:
//! the cache endpoint never serves an object the index does not know about.

pub mod sqlite;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::types::Provenance;

pub use sqlite::{ArtifactIndex, PendingDownload};

/// Index errors
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Artifact {project_id}/{hash} is already recorded")]
    Duplicate { project_id: String, hash: String },

    #[error("Unknown project: {0}")]
    UnknownProject(String),

    #[error("Index database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Index I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A stored artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRecord {
    pub hash: String,
    pub project_id: String,
    /// Size in bytes as measured by the server
    pub size: i64,
    /// Orchestrator project label
    pub nx_project: Option<String>,
    /// Orchestrator target label
    pub nx_target: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Successful downloads so far
    pub downloads: i64,
}

/// Values for a new artifact record
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub project_id: String,
    pub hash: String,
    pub size: i64,
    pub provenance: Provenance,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A project artifacts can be stored under
#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ProjectRecord {
    pub id: String,
    pub name: Option<String>,
    pub created_at: DateTime<Utc>,
}
