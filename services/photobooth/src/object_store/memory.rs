use super::{ObjectDownload, ObjectId, ObjectStore, ObjectStoreError, ObjectUpload, StoredObject};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use dashmap::DashMap;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::debug;

struct MemoryObject {
    object: StoredObject,
    chunks: Vec<Bytes>,
}

/// In-memory object store using `DashMap`. Suitable for development and testing.
///
/// Finalized payloads are split into fixed-size chunks and streamed back chunk
/// by chunk, like a chunked large-object store.
#[derive(Clone)]
pub struct MemoryObjectStore {
    objects: Arc<DashMap<ObjectId, MemoryObject>>,
    chunk_size: usize,
}

impl MemoryObjectStore {
    /// Create an empty store that serves reads in `chunk_size` pieces.
    pub fn new(chunk_size: usize) -> Self {
        Self {
            objects: Arc::new(DashMap::new()),
            chunk_size: chunk_size.max(1),
        }
    }

    /// Number of finalized objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Whether an object with this id is finalized.
    pub fn contains(&self, id: ObjectId) -> bool {
        self.objects.contains_key(&id)
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new(255 * 1024)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn open_upload(
        &self,
        filename: &str,
        content_type: &str,
    ) -> Result<Box<dyn ObjectUpload>, ObjectStoreError> {
        Ok(Box::new(MemoryUpload {
            id: ObjectId::new(),
            filename: filename.to_string(),
            content_type: content_type.to_string(),
            buffer: BytesMut::new(),
            objects: self.objects.clone(),
            chunk_size: self.chunk_size,
            finished: false,
        }))
    }

    async fn open_download(&self, id: ObjectId) -> Result<ObjectDownload, ObjectStoreError> {
        let entry = self.objects.get(&id).ok_or(ObjectStoreError::NotFound(id))?;
        let object = entry.object.clone();
        let chunks = entry.chunks.clone();
        drop(entry);

        Ok(ObjectDownload {
            object,
            body: stream::iter(chunks.into_iter().map(Ok)).boxed(),
        })
    }

    async fn stat(&self, id: ObjectId) -> Result<Option<StoredObject>, ObjectStoreError> {
        Ok(self.objects.get(&id).map(|entry| entry.object.clone()))
    }

    async fn delete(&self, id: ObjectId) -> Result<bool, ObjectStoreError> {
        Ok(self.objects.remove(&id).is_some())
    }

    async fn health_check(&self) -> Result<(), ObjectStoreError> {
        Ok(())
    }
}

struct MemoryUpload {
    id: ObjectId,
    filename: String,
    content_type: String,
    buffer: BytesMut,
    objects: Arc<DashMap<ObjectId, MemoryObject>>,
    chunk_size: usize,
    finished: bool,
}

#[async_trait]
impl ObjectUpload for MemoryUpload {
    fn id(&self) -> ObjectId {
        self.id
    }

    async fn write(&mut self, chunk: Bytes) -> Result<(), ObjectStoreError> {
        if self.finished {
            return Err(ObjectStoreError::UploadClosed(self.id));
        }
        self.buffer.extend_from_slice(&chunk);
        Ok(())
    }

    async fn finalize(&mut self) -> Result<StoredObject, ObjectStoreError> {
        if self.finished {
            return Err(ObjectStoreError::UploadClosed(self.id));
        }
        self.finished = true;

        let data = std::mem::take(&mut self.buffer).freeze();
        let chunks: Vec<Bytes> = (0..data.len())
            .step_by(self.chunk_size)
            .map(|start| data.slice(start..(start + self.chunk_size).min(data.len())))
            .collect();

        let object = StoredObject {
            id: self.id,
            filename: self.filename.clone(),
            content_type: self.content_type.clone(),
            length: data.len() as u64,
            uploaded_at: Utc::now(),
        };

        self.objects.insert(
            self.id,
            MemoryObject {
                object: object.clone(),
                chunks,
            },
        );

        debug!(object_id = %self.id, length = object.length, "Object finalized");
        Ok(object)
    }

    async fn abort(&mut self) -> Result<(), ObjectStoreError> {
        self.finished = true;
        self.buffer.clear();
        Ok(())
    }
}
