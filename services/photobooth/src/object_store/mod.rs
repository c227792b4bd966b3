mod memory;
mod s3;

pub use memory::MemoryObjectStore;
pub use s3::S3ObjectStore;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Identifier of a stored object, generated by the store when an upload opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(Uuid);

impl ObjectId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for ObjectId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Errors from object store operations.
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object not found: {0}")]
    NotFound(ObjectId),

    #[error("object store not ready: {0}")]
    NotReady(String),

    #[error("upload {0} is already finished")]
    UploadClosed(ObjectId),

    #[error("object store backend error: {0}")]
    Backend(String),
}

/// Descriptor of a durable object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub id: ObjectId,
    pub filename: String,
    pub content_type: String,
    pub length: u64,
    pub uploaded_at: DateTime<Utc>,
}

/// An in-flight upload. Nothing is readable until `finalize` succeeds.
#[async_trait]
pub trait ObjectUpload: Send {
    /// Identifier the object will have once finalized.
    fn id(&self) -> ObjectId;

    /// Append bytes to the upload.
    async fn write(&mut self, chunk: Bytes) -> Result<(), ObjectStoreError>;

    /// Make the object durable and readable. The handle cannot be reused.
    async fn finalize(&mut self) -> Result<StoredObject, ObjectStoreError>;

    /// Discard the upload and any parts already sent.
    async fn abort(&mut self) -> Result<(), ObjectStoreError>;
}

/// A streamed object read.
pub struct ObjectDownload {
    pub object: StoredObject,
    pub body: BoxStream<'static, Result<Bytes, ObjectStoreError>>,
}

impl ObjectDownload {
    /// Collect the whole body. Meant for small objects and tests.
    pub async fn into_bytes(self) -> Result<Bytes, ObjectStoreError> {
        let mut body = self.body;
        let mut buffer = BytesMut::with_capacity(self.object.length as usize);
        while let Some(chunk) = body.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }
}

impl fmt::Debug for ObjectDownload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectDownload")
            .field("object", &self.object)
            .finish_non_exhaustive()
    }
}

/// Content-agnostic blob store keyed by generated identifiers.
///
/// Objects only become visible to readers after [`ObjectUpload::finalize`]
/// returns. Deleting an absent object is not an error; it reports `false`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Open a streamed upload. The returned handle carries the new object id.
    async fn open_upload(
        &self,
        filename: &str,
        content_type: &str,
    ) -> Result<Box<dyn ObjectUpload>, ObjectStoreError>;

    /// Stream a finalized object. Fails with `NotFound` for unknown ids.
    async fn open_download(&self, id: ObjectId) -> Result<ObjectDownload, ObjectStoreError>;

    /// Describe a finalized object without reading it.
    async fn stat(&self, id: ObjectId) -> Result<Option<StoredObject>, ObjectStoreError>;

    /// Delete an object. Returns `true` if it existed.
    async fn delete(&self, id: ObjectId) -> Result<bool, ObjectStoreError>;

    /// Check that the backend is reachable.
    async fn health_check(&self) -> Result<(), ObjectStoreError>;
}

/// Write `data` as a new object in `chunk_size` pieces.
///
/// The upload is aborted if any write fails, so a failed call never leaves a
/// readable object behind.
pub async fn put_object(
    store: &dyn ObjectStore,
    filename: &str,
    content_type: &str,
    data: Bytes,
    chunk_size: usize,
) -> Result<StoredObject, ObjectStoreError> {
    let mut upload = store.open_upload(filename, content_type).await?;
    let chunk_size = chunk_size.max(1);

    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + chunk_size).min(data.len());
        if let Err(e) = upload.write(data.slice(offset..end)).await {
            abort_quietly(upload.as_mut()).await;
            return Err(e);
        }
        offset = end;
    }

    match upload.finalize().await {
        Ok(object) => Ok(object),
        Err(e) => {
            abort_quietly(upload.as_mut()).await;
            Err(e)
        }
    }
}

/// Log and count an object that no record or binding references any more.
pub(crate) fn record_orphan(id: ObjectId, reason: &str) {
    warn!(object_id = %id, reason, "Orphaned object left in store");
    metrics::counter!("photobooth.objects.orphaned").increment(1);
}

async fn abort_quietly(upload: &mut dyn ObjectUpload) {
    let id = upload.id();
    if let Err(e) = upload.abort().await {
        warn!(object_id = %id, error = %e, "Failed to abort upload");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_round_trip_display() {
        let id = ObjectId::new();
        let parsed: ObjectId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
        assert!("not-a-uuid".parse::<ObjectId>().is_err());
    }

    #[tokio::test]
    async fn test_put_object_chunks_and_reads_back() {
        let store = MemoryObjectStore::new(4);
        let data = Bytes::from_static(b"0123456789");

        let object = put_object(&store, "a.jpg", "image/jpeg", data.clone(), 3)
            .await
            .unwrap();
        assert_eq!(object.length, 10);

        let download = store.open_download(object.id).await.unwrap();
        assert_eq!(download.into_bytes().await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_put_object_aborts_on_write_failure() {
        struct FailingUpload {
            id: ObjectId,
            aborted: std::sync::Arc<std::sync::atomic::AtomicBool>,
        }

        #[async_trait]
        impl ObjectUpload for FailingUpload {
            fn id(&self) -> ObjectId {
                self.id
            }
            async fn write(&mut self, _chunk: Bytes) -> Result<(), ObjectStoreError> {
                Err(ObjectStoreError::Backend("connection reset".to_string()))
            }
            async fn finalize(&mut self) -> Result<StoredObject, ObjectStoreError> {
                unreachable!("finalize after failed write")
            }
            async fn abort(&mut self) -> Result<(), ObjectStoreError> {
                self.aborted.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
        }

        let aborted = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = aborted.clone();

        let mut store = MockObjectStore::new();
        store.expect_open_upload().returning(move |_, _| {
            Ok(Box::new(FailingUpload {
                id: ObjectId::new(),
                aborted: flag.clone(),
            }))
        });

        let result = put_object(&store, "a.jpg", "image/jpeg", Bytes::from_static(b"abc"), 2).await;
        assert!(matches!(result, Err(ObjectStoreError::Backend(_))));
        assert!(aborted.load(std::sync::atomic::Ordering::SeqCst));
    }
}
