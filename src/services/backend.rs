//! Capability interface of the backend content store plus `FsBackend`, the
//! local-disk implementation. Payloads are sharded beneath
//! `base_path/{bucket}/{shard}/{shard}/{key-digest}/{name}` so arbitrary keys
//! never turn into filesystem paths.

use crate::{
    models::{object::ObjectRecord, part::PartRecord},
    services::error::BackendError,
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{StreamExt, pin_mut, stream::BoxStream};
use md5::Context;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

pub type BodyStream = BoxStream<'static, io::Result<Bytes>>;

/// Address of a payload in the backend store.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct BackendKey {
    pub bucket: String,
    pub key: String,
    /// Internal name distinguishing versions and parts of the same key.
    pub name: String,
}

impl BackendKey {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            name: name.into(),
        }
    }

    /// Payload of an object record, named by its uuid.
    ///
    /// Returns `None` for records that were never persisted.
    pub fn for_object(record: &ObjectRecord) -> Option<Self> {
        record
            .uuid
            .map(|uuid| Self::new(&record.bucket, &record.key, uuid.to_string()))
    }

    /// Payload of a single part of a multipart upload.
    pub fn for_part(part: &PartRecord) -> Self {
        Self::new(
            &part.bucket,
            &part.key,
            format!("{}.{}.{}", part.upload_id, part.part_number, part.uuid),
        )
    }
}

/// What the backend reports after storing content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentReceipt {
    pub etag: Option<String>,
    pub size: i64,
    pub last_modified: DateTime<Utc>,
}

impl ContentReceipt {
    pub fn new(etag: impl Into<String>, size: i64) -> Self {
        Self {
            etag: Some(etag.into()),
            size,
            last_modified: Utc::now(),
        }
    }

    pub fn at(mut self, last_modified: DateTime<Utc>) -> Self {
        self.last_modified = last_modified;
        self
    }
}

/// Operations required of the backend content store.
///
/// Every operation is idempotent and either succeeds or fails as a whole.
#[async_trait]
pub trait BackendStore: Send + Sync {
    async fn put(&self, key: &BackendKey, body: BodyStream) -> Result<ContentReceipt, BackendError>;

    async fn get(&self, key: &BackendKey) -> Result<BodyStream, BackendError>;

    /// Removing an absent payload succeeds.
    async fn delete(&self, key: &BackendKey) -> Result<(), BackendError>;

    async fn copy(&self, from: &BackendKey, to: &BackendKey) -> Result<ContentReceipt, BackendError>;
}

/// Backend storing payloads as files on local disk.
#[derive(Clone, Debug)]
pub struct FsBackend {
    base_path: PathBuf,
}

impl FsBackend {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn bucket_root(&self, bucket_name: &str) -> PathBuf {
        let mut path = self.base_path.clone();
        path.push(bucket_name);
        path
    }

    /// Two-level shard identifiers from MD5(bucket/key), as lowercase hex.
    fn object_shards(bucket_name: &str, key: &str) -> (String, String, String) {
        let digest = md5::compute(format!("{}/{}", bucket_name, key));
        (
            format!("{:02x}", digest[0]),
            format!("{:02x}", digest[1]),
            format!("{:x}", digest),
        )
    }

    fn payload_path(&self, key: &BackendKey) -> PathBuf {
        let (shard_a, shard_b, key_digest) = Self::object_shards(&key.bucket, &key.key);
        let mut path = self.bucket_root(&key.bucket);
        path.push(shard_a);
        path.push(shard_b);
        path.push(key_digest);
        path.push(&key.name);
        path
    }

    fn ensure_name_safe(key: &BackendKey) -> Result<(), BackendError> {
        let bad = |s: &str| s.is_empty() || s.contains('/') || s.contains('\\') || s.contains("..");
        if bad(&key.bucket) || bad(&key.name) {
            return Err(BackendError::Rejected(format!(
                "unsafe backend name {}/{}",
                key.bucket, key.name
            )));
        }
        Ok(())
    }

    /// Recursively remove empty directories up to the bucket root.
    async fn prune_empty_dirs(&self, start: &Path, stop: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(stop) && current != stop {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

#[async_trait]
impl BackendStore for FsBackend {
    /// Streams the body to a temp file, fsyncs, then renames into place.
    async fn put(&self, key: &BackendKey, body: BodyStream) -> Result<ContentReceipt, BackendError> {
        Self::ensure_name_safe(key)?;
        let file_path = self.payload_path(key);
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| io::Error::other("payload path missing parent directory"))?;
        fs::create_dir_all(&parent).await?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await?;

        let mut size: i64 = 0;
        let mut digest = Context::new();
        let stream = body;
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(err.into());
                }
            };
            size += chunk.len() as i64;
            digest.consume(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(err.into());
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }

        let etag = format!("{:x}", digest.compute());
        debug!(bucket = %key.bucket, key = %key.key, name = %key.name, size, "stored payload");
        Ok(ContentReceipt::new(etag, size))
    }

    async fn get(&self, key: &BackendKey) -> Result<BodyStream, BackendError> {
        Self::ensure_name_safe(key)?;
        let file_path = self.payload_path(key);
        let file = File::open(&file_path).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                BackendError::NotFound(format!("{}/{}", key.bucket, key.name))
            } else {
                BackendError::Io(err)
            }
        })?;
        Ok(ReaderStream::new(file).boxed())
    }

    async fn delete(&self, key: &BackendKey) -> Result<(), BackendError> {
        Self::ensure_name_safe(key)?;
        let file_path = self.payload_path(key);
        match fs::remove_file(&file_path).await {
            Ok(_) => debug!("removed payload {}", file_path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("payload {} already missing", file_path.display());
            }
            Err(err) => return Err(err.into()),
        }

        if let Some(parent) = file_path.parent() {
            let bucket_root = self.bucket_root(&key.bucket);
            self.prune_empty_dirs(parent, &bucket_root).await;
        }
        Ok(())
    }

    async fn copy(&self, from: &BackendKey, to: &BackendKey) -> Result<ContentReceipt, BackendError> {
        let body = self.get(from).await?;
        self.put(to, body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn body(data: &'static [u8]) -> BodyStream {
        stream::iter(vec![Ok(Bytes::from_static(data))]).boxed()
    }

    async fn read_all(mut stream: BodyStream) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn put_get_delete_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path());
        let key = BackendKey::new("photos", "2025/cat.png", "v1");

        let receipt = backend.put(&key, body(b"meow")).await.unwrap();
        assert_eq!(receipt.size, 4);
        assert_eq!(receipt.etag.as_deref(), Some("4a4be40c96ac6314e91d93f38043a634"));

        let data = read_all(backend.get(&key).await.unwrap()).await;
        assert_eq!(data, b"meow");

        backend.delete(&key).await.unwrap();
        assert!(matches!(
            backend.get(&key).await,
            Err(BackendError::NotFound(_))
        ));
        // idempotent
        backend.delete(&key).await.unwrap();
        assert!(!dir.path().join("photos").read_dir().unwrap().any(|_| true));
    }

    #[tokio::test]
    async fn copy_duplicates_payload() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path());
        let from = BackendKey::new("photos", "a.txt", "v1");
        let to = BackendKey::new("photos", "b.txt", "v1");

        backend.put(&from, body(b"hello")).await.unwrap();
        let receipt = backend.copy(&from, &to).await.unwrap();
        assert_eq!(receipt.size, 5);
        assert_eq!(read_all(backend.get(&to).await.unwrap()).await, b"hello");
    }

    #[tokio::test]
    async fn rejects_traversal_names() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FsBackend::new(dir.path());
        let key = BackendKey::new("photos", "a", "../escape");
        assert!(matches!(
            backend.put(&key, body(b"x")).await,
            Err(BackendError::Rejected(_))
        ));
    }
}
