//! Object storage for artifact bodies
//!
//! Objects are addressed by `{project_id}/{hash}` and written once per
//! artifact version. Bodies move as async readers in both directions so
//! nothing is held in memory in full.

pub mod disk;
pub mod memory;

use std::fmt;
use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::protocol;

pub use disk::DiskObjectStore;
pub use memory::MemoryObjectStore;

/// Boxed body reader
pub type ObjectBody = Pin<Box<dyn AsyncRead + Send>>;

/// Object store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid object key segment: {0:?}")]
    InvalidKey(String),

    #[error("Object storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt object metadata: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Composite key of a stored object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    project_id: String,
    hash: String,
}

impl ObjectKey {
    /// Build a key, rejecting segments that are not safe as path components
    pub fn new(project_id: &str, hash: &str) -> Result<Self, StoreError> {
        for segment in [project_id, hash] {
            if !protocol::is_valid_segment(segment) {
                return Err(StoreError::InvalidKey(segment.to_string()));
            }
        }
        Ok(Self {
            project_id: project_id.to_string(),
            hash: hash.to_string(),
        })
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&protocol::object_key(&self.project_id, &self.hash))
    }
}

/// Options for writing an object
#[derive(Debug, Clone)]
pub struct PutOptions {
    pub content_type: String,
    /// When the object stops being worth keeping
    pub expires_at: Option<DateTime<Utc>>,
}

/// Metadata kept alongside every object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Bytes actually written, measured while streaming
    pub content_length: u64,
    pub content_type: String,
    /// Hex SHA-1 of the body
    pub sha1: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A stored object opened for reading
pub struct StoredObject {
    pub meta: ObjectMeta,
    pub body: ObjectBody,
}

/// Durable blob storage
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stream `body` into the object at `key`, replacing any previous version
    ///
    /// The object only becomes visible once the body was fully written.
    async fn put(
        &self,
        key: &ObjectKey,
        body: ObjectBody,
        options: PutOptions,
    ) -> Result<ObjectMeta, StoreError>;

    /// Open an object; `None` if it does not exist
    async fn get(&self, key: &ObjectKey) -> Result<Option<StoredObject>, StoreError>;

    /// Remove an object; removing a missing object is not an error
    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_display() {
        let key = ObjectKey::new("p1", "abc123").unwrap();
        assert_eq!(key.to_string(), "p1/abc123");
        assert_eq!(key.project_id(), "p1");
        assert_eq!(key.hash(), "abc123");
    }

    #[test]
    fn test_key_rejects_traversal() {
        assert!(matches!(
            ObjectKey::new("..", "abc123"),
            Err(StoreError::InvalidKey(_))
        ));
        assert!(ObjectKey::new("p1", "a/b").is_err());
    }
}
