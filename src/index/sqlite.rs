//! SQLite-backed artifact index

use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::{Sqlite, Transaction};
use tracing::{debug, info};

use super::{ArtifactRecord, IndexError, NewArtifact, ProjectRecord};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS artifacts (
    hash TEXT NOT NULL,
    project_id TEXT NOT NULL REFERENCES projects(id),
    size INTEGER NOT NULL,
    nx_project TEXT,
    nx_target TEXT,
    start_time TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT,
    expires_at TEXT,
    downloads INTEGER NOT NULL DEFAULT 0 CHECK (downloads >= 0),
    PRIMARY KEY (hash, project_id)
);

CREATE INDEX IF NOT EXISTS idx_artifacts_project_id ON artifacts(project_id);
"#;

/// Artifact index stored in a SQLite database
#[derive(Clone)]
pub struct ArtifactIndex {
    pool: SqlitePool,
}

/// A download whose counter increment is not yet committed
///
/// Dropping it without [`PendingDownload::commit`] rolls the increment back.
pub struct PendingDownload {
    tx: Transaction<'static, Sqlite>,
    record: ArtifactRecord,
}

impl PendingDownload {
    /// The record as it will look once committed
    pub fn record(&self) -> &ArtifactRecord {
        &self.record
    }

    /// Make the increment durable
    pub async fn commit(self) -> Result<ArtifactRecord, IndexError> {
        self.tx.commit().await?;
        Ok(self.record)
    }

    /// Undo the increment
    pub async fn abandon(self) -> Result<(), IndexError> {
        self.tx.rollback().await?;
        Ok(())
    }
}

impl ArtifactIndex {
    /// Open (creating if needed) the index database at `path`
    pub async fn open(path: &Path) -> Result<Self, IndexError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        // One connection: SQLite allows a single writer anyway, and every
        // counter increment then runs strictly one after another.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let index = Self { pool };
        index.migrate().await?;

        info!(path = %path.display(), "Artifact index opened");
        Ok(index)
    }

    async fn migrate(&self) -> Result<(), IndexError> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// Register a project with a fresh id
    pub async fn create_project(&self, name: &str) -> Result<ProjectRecord, IndexError> {
        let id = uuid::Uuid::new_v4().to_string();
        self.create_project_with_id(&id, name).await
    }

    /// Register a project under a caller-chosen id
    pub async fn create_project_with_id(
        &self,
        id: &str,
        name: &str,
    ) -> Result<ProjectRecord, IndexError> {
        let project = sqlx::query_as::<_, ProjectRecord>(
            "INSERT INTO projects (id, name, created_at) VALUES (?, ?, ?) RETURNING *",
        )
        .bind(id)
        .bind(name)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        info!(project_id = %project.id, name = name, "Created project");
        Ok(project)
    }

    /// Whether a project exists
    pub async fn project_exists(&self, project_id: &str) -> Result<bool, IndexError> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM projects WHERE id = ?)")
            .bind(project_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(exists)
    }

    /// Record a newly stored artifact
    ///
    /// Fails with [`IndexError::Duplicate`] if the pair is already recorded;
    /// the existing record is left untouched.
    pub async fn insert(&self, artifact: &NewArtifact) -> Result<ArtifactRecord, IndexError> {
        let now = Utc::now();
        let result = sqlx::query_as::<_, ArtifactRecord>(
            "INSERT INTO artifacts \
             (hash, project_id, size, nx_project, nx_target, start_time, created_at, updated_at, expires_at, downloads) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0) \
             RETURNING *",
        )
        .bind(&artifact.hash)
        .bind(&artifact.project_id)
        .bind(artifact.size)
        .bind(artifact.provenance.project_name.as_deref())
        .bind(artifact.provenance.target.as_deref())
        .bind(artifact.provenance.started_at())
        .bind(now)
        .bind(now)
        .bind(artifact.expires_at)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(record) => {
                debug!(
                    project_id = %record.project_id,
                    hash = %record.hash,
                    size = record.size,
                    "Recorded artifact"
                );
                Ok(record)
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(IndexError::Duplicate {
                    project_id: artifact.project_id.clone(),
                    hash: artifact.hash.clone(),
                })
            }
            Err(sqlx::Error::Database(e)) if e.is_foreign_key_violation() => {
                Err(IndexError::UnknownProject(artifact.project_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Increment the download counter of an artifact and return its record
    ///
    /// The increment is a single conditional update; `None` means no such
    /// artifact and nothing was changed. The returned handle must be
    /// committed for the increment to stick.
    ///
    /// The handle holds the pool's only connection until it is committed or
    /// abandoned, so every other index operation waits behind whatever the
    /// caller does in between, opening the stored object included.
    pub async fn increment_download_and_fetch(
        &self,
        project_id: &str,
        hash: &str,
    ) -> Result<Option<PendingDownload>, IndexError> {
        let mut tx = self.pool.begin().await?;

        let record = sqlx::query_as::<_, ArtifactRecord>(
            "UPDATE artifacts SET downloads = downloads + 1, updated_at = ? \
             WHERE project_id = ? AND hash = ? \
             RETURNING *",
        )
        .bind(Utc::now())
        .bind(project_id)
        .bind(hash)
        .fetch_optional(&mut *tx)
        .await?;

        match record {
            Some(record) => Ok(Some(PendingDownload { tx, record })),
            None => {
                tx.rollback().await?;
                Ok(None)
            }
        }
    }

    /// Look up one artifact without touching it
    pub async fn get(
        &self,
        project_id: &str,
        hash: &str,
    ) -> Result<Option<ArtifactRecord>, IndexError> {
        let record = sqlx::query_as::<_, ArtifactRecord>(
            "SELECT * FROM artifacts WHERE project_id = ? AND hash = ?",
        )
        .bind(project_id)
        .bind(hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    /// All artifacts of a project, newest first
    pub async fn list_project(&self, project_id: &str) -> Result<Vec<ArtifactRecord>, IndexError> {
        let records = sqlx::query_as::<_, ArtifactRecord>(
            "SELECT * FROM artifacts WHERE project_id = ? ORDER BY created_at DESC, hash",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Provenance;
    use tempfile::TempDir;

    async fn index_with_project(temp: &TempDir) -> ArtifactIndex {
        let index = ArtifactIndex::open(&temp.path().join("index.sqlite"))
            .await
            .unwrap();
        index.create_project_with_id("p1", "demo").await.unwrap();
        index
    }

    fn artifact(hash: &str) -> NewArtifact {
        NewArtifact {
            project_id: "p1".to_string(),
            hash: hash.to_string(),
            size: 10,
            provenance: Provenance {
                project_name: Some("web".to_string()),
                target: Some("build".to_string()),
                start_time: Some(1_700_000_000_000),
            },
            expires_at: None,
        }
    }

    #[tokio::test]
    async fn test_projects() {
        let temp = TempDir::new().unwrap();
        let index = index_with_project(&temp).await;

        assert!(index.project_exists("p1").await.unwrap());
        assert!(!index.project_exists("p2").await.unwrap());

        let created = index.create_project("other").await.unwrap();
        assert!(index.project_exists(&created.id).await.unwrap());
        assert_eq!(created.name.as_deref(), Some("other"));
    }

    #[tokio::test]
    async fn test_insert_and_get() {
        let temp = TempDir::new().unwrap();
        let index = index_with_project(&temp).await;

        let record = index.insert(&artifact("abc123")).await.unwrap();
        assert_eq!(record.downloads, 0);
        assert_eq!(record.size, 10);
        assert_eq!(record.nx_project.as_deref(), Some("web"));
        assert_eq!(record.nx_target.as_deref(), Some("build"));
        assert_eq!(
            record.start_time.map(|t| t.timestamp_millis()),
            Some(1_700_000_000_000)
        );

        let fetched = index.get("p1", "abc123").await.unwrap().unwrap();
        assert_eq!(fetched, record);
    }

    #[tokio::test]
    async fn test_duplicate_insert_keeps_original() {
        let temp = TempDir::new().unwrap();
        let index = index_with_project(&temp).await;

        index.insert(&artifact("abc123")).await.unwrap();
        index
            .increment_download_and_fetch("p1", "abc123")
            .await
            .unwrap()
            .unwrap()
            .commit()
            .await
            .unwrap();

        let mut again = artifact("abc123");
        again.size = 99;
        let result = index.insert(&again).await;
        assert!(matches!(result, Err(IndexError::Duplicate { .. })));

        let record = index.get("p1", "abc123").await.unwrap().unwrap();
        assert_eq!(record.size, 10);
        assert_eq!(record.downloads, 1);
    }

    #[tokio::test]
    async fn test_insert_unknown_project() {
        let temp = TempDir::new().unwrap();
        let index = index_with_project(&temp).await;

        let mut orphan = artifact("abc123");
        orphan.project_id = "nope".to_string();
        let result = index.insert(&orphan).await;
        assert!(matches!(result, Err(IndexError::UnknownProject(_))));
    }

    #[tokio::test]
    async fn test_increment_missing_has_no_effect() {
        let temp = TempDir::new().unwrap();
        let index = index_with_project(&temp).await;
        index.insert(&artifact("abc123")).await.unwrap();

        let pending = index
            .increment_download_and_fetch("p1", "doesnotexist")
            .await
            .unwrap();
        assert!(pending.is_none());

        let record = index.get("p1", "abc123").await.unwrap().unwrap();
        assert_eq!(record.downloads, 0);
    }

    #[tokio::test]
    async fn test_abandoned_increment_rolls_back() {
        let temp = TempDir::new().unwrap();
        let index = index_with_project(&temp).await;
        index.insert(&artifact("abc123")).await.unwrap();

        let pending = index
            .increment_download_and_fetch("p1", "abc123")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pending.record().downloads, 1);
        pending.abandon().await.unwrap();

        let record = index.get("p1", "abc123").await.unwrap().unwrap();
        assert_eq!(record.downloads, 0);
    }

    #[tokio::test]
    async fn test_pending_download_holds_the_connection() {
        let temp = TempDir::new().unwrap();
        let index = index_with_project(&temp).await;
        index.insert(&artifact("abc123")).await.unwrap();

        let pending = index
            .increment_download_and_fetch("p1", "abc123")
            .await
            .unwrap()
            .unwrap();
        let blocked =
            tokio::time::timeout(Duration::from_millis(100), index.get("p1", "abc123")).await;
        assert!(blocked.is_err());

        pending.commit().await.unwrap();
        let record = index.get("p1", "abc123").await.unwrap().unwrap();
        assert_eq!(record.downloads, 1);
    }

    #[tokio::test]
    async fn test_concurrent_increments_are_not_lost() {
        let temp = TempDir::new().unwrap();
        let index = index_with_project(&temp).await;
        index.insert(&artifact("abc123")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let index = index.clone();
            handles.push(tokio::spawn(async move {
                index
                    .increment_download_and_fetch("p1", "abc123")
                    .await
                    .unwrap()
                    .unwrap()
                    .commit()
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let record = index.get("p1", "abc123").await.unwrap().unwrap();
        assert_eq!(record.downloads, 20);
    }

    #[tokio::test]
    async fn test_list_project() {
        let temp = TempDir::new().unwrap();
        let index = index_with_project(&temp).await;
        index.insert(&artifact("aaa")).await.unwrap();
        index.insert(&artifact("bbb")).await.unwrap();

        let records = index.list_project("p1").await.unwrap();
        assert_eq!(records.len(), 2);
        assert!(index.list_project("p2").await.unwrap().is_empty());
    }
}
