//! On-disk object store
//!
//! Layout under the root directory:
//!
//! ```text
//! {project_id}/{hash}            object body
//! {project_id}/{hash}.meta.json  ObjectMeta sidecar
//! {project_id}/.{hash}.{id}.tmp  body being written
//! ```
//!
//! Bodies are streamed into a temp file and renamed into place. The sidecar
//! is written last, so an object without a sidecar is not visible.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use sha1::{Digest, Sha1};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::{ObjectBody, ObjectKey, ObjectMeta, ObjectStore, PutOptions, StoreError, StoredObject};

/// Read buffer used while streaming bodies to disk
const COPY_BUFFER_SIZE: usize = 64 * 1024;

const META_SUFFIX: &str = ".meta.json";
const TEMP_EXTENSION: &str = "tmp";

/// Object store backed by a local directory
pub struct DiskObjectStore {
    /// Root directory for stored objects
    root: PathBuf,
}

impl DiskObjectStore {
    /// Open (and create if needed) a store rooted at `root`
    ///
    /// Temp files left behind by interrupted writes are removed.
    pub fn new(root: PathBuf) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&root)?;

        let store = Self { root };
        store.cleanup();

        info!(root = %store.root.display(), "Object store initialized");
        Ok(store)
    }

    /// Remove stale temp files from previous runs
    pub fn cleanup(&self) {
        let Ok(projects) = std::fs::read_dir(&self.root) else {
            return;
        };
        for project in projects.flatten() {
            let Ok(entries) = std::fs::read_dir(project.path()) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().is_some_and(|ext| ext == TEMP_EXTENSION) {
                    debug!(path = %path.display(), "Removing stale temp file");
                    let _ = std::fs::remove_file(&path);
                }
            }
        }
    }

    fn project_dir(&self, key: &ObjectKey) -> PathBuf {
        self.root.join(key.project_id())
    }

    fn object_path(&self, key: &ObjectKey) -> PathBuf {
        self.project_dir(key).join(key.hash())
    }

    fn meta_path(&self, key: &ObjectKey) -> PathBuf {
        self.project_dir(key)
            .join(format!("{}{}", key.hash(), META_SUFFIX))
    }

    fn temp_path(&self, key: &ObjectKey) -> PathBuf {
        self.project_dir(key).join(format!(
            ".{}.{}.{}",
            key.hash(),
            uuid::Uuid::new_v4(),
            TEMP_EXTENSION
        ))
    }

    async fn write_meta(&self, key: &ObjectKey, meta: &ObjectMeta) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(meta)?;
        let temp = self.temp_path(key);
        if let Err(e) = fs::write(&temp, &json).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        fs::rename(&temp, self.meta_path(key)).await?;
        Ok(())
    }

    async fn read_meta(&self, key: &ObjectKey) -> Result<Option<ObjectMeta>, StoreError> {
        match fs::read(self.meta_path(key)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Stream `body` into a new file, returning the byte count and hex SHA-1
async fn write_body(path: &Path, mut body: ObjectBody) -> io::Result<(u64, String)> {
    let mut file = fs::File::create(path).await?;
    let mut hasher = Sha1::new();
    let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
    let mut written: u64 = 0;

    loop {
        let read = body.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        file.write_all(&buffer[..read]).await?;
        written += read as u64;
    }

    file.flush().await?;
    file.sync_all().await?;
    Ok((written, format!("{:x}", hasher.finalize())))
}

fn ignore_not_found(result: io::Result<()>) -> io::Result<()> {
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

#[async_trait]
impl ObjectStore for DiskObjectStore {
    async fn put(
        &self,
        key: &ObjectKey,
        body: ObjectBody,
        options: PutOptions,
    ) -> Result<ObjectMeta, StoreError> {
        fs::create_dir_all(self.project_dir(key)).await?;

        let temp = self.temp_path(key);
        let (content_length, sha1) = match write_body(&temp, body).await {
            Ok(written) => written,
            Err(e) => {
                warn!(key = %key, error = %e, "Object write aborted");
                let _ = fs::remove_file(&temp).await;
                return Err(e.into());
            }
        };
        fs::rename(&temp, self.object_path(key)).await?;

        let meta = ObjectMeta {
            content_length,
            content_type: options.content_type,
            sha1,
            created_at: Utc::now(),
            expires_at: options.expires_at,
        };
        self.write_meta(key, &meta).await?;

        debug!(key = %key, size = content_length, "Stored object");
        Ok(meta)
    }

    async fn get(&self, key: &ObjectKey) -> Result<Option<StoredObject>, StoreError> {
        let Some(mut meta) = self.read_meta(key).await? else {
            return Ok(None);
        };

        match fs::File::open(self.object_path(key)).await {
            Ok(file) => {
                // The sidecar may describe a body that was replaced after it was read;
                // the length must match the file actually opened
                meta.content_length = file.metadata().await?.len();
                Ok(Some(StoredObject {
                    meta,
                    body: Box::pin(file),
                }))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(key = %key, "Object metadata present without a body");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &ObjectKey) -> Result<(), StoreError> {
        // Sidecar first so the object disappears before its body does
        ignore_not_found(fs::remove_file(self.meta_path(key)).await)?;
        ignore_not_found(fs::remove_file(self.object_path(key)).await)?;
        debug!(key = %key, "Deleted object");
        Ok(())
    }
}
