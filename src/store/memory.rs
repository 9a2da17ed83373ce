//! In-memory object store, for tests and throwaway servers

use std::collections::HashMap;
use std::io::Cursor;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use sha1::{Digest, Sha1};
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;

use super::{ObjectBody, ObjectKey, ObjectMeta, ObjectStore, PutOptions, StoreError, StoredObject};

/// Object store keeping every body in memory
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<ObjectKey, (ObjectMeta, Bytes)>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    pub async fn contains(&self, key: &ObjectKey) -> bool {
        self.objects.read().await.contains_key(key)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(
        &self,
        key: &ObjectKey,
        mut body: ObjectBody,
        options: PutOptions,
    ) -> Result<ObjectMeta, StoreError> {
        let mut data = Vec::new();
        body.read_to_end(&mut data).await?;

        let meta = ObjectMeta {
            content_length: data.len() as u64,
            content_type: options.content_type,
            sha1: format!("{:x}", Sha1::digest(&data)),
            created_at: Utc::now(),
            expires_at: options.expires_at,
        };
        self.objects
            .write()
            .await
            .insert(key.clone(), (meta.clone(), Bytes::from(data)));
        Ok(meta)
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<StoredObject>, StoreError> {
        let objects = self.objects.read().await;
        Ok(objects.get(key).map(|(meta, data)| StoredObject {
            meta: meta.clone(),
            body: Box::pin(Cursor::new(data.clone())),
        }))
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        self.objects.write().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_round_trip() {
        let store = MemoryObjectStore::new();
        let key = ObjectKey::new("p1", "abc123").unwrap();
        let options = PutOptions {
            content_type: "application/octet-stream".to_string(),
            expires_at: None,
        };

        let meta = store.put(&key, Box::pin(&b"hello"[..]), options).await.unwrap();
        assert_eq!(meta.content_length, 5);
        assert!(store.contains(&key).await);

        let mut object = store.get(&key).await.unwrap().unwrap();
        let mut data = Vec::new();
        object.body.read_to_end(&mut data).await.unwrap();
        assert_eq!(data, b"hello");

        store.delete(&key).await.unwrap();
        assert!(store.is_empty().await);
    }
}
