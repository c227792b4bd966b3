use super::{ObjectDownload, ObjectId, ObjectStore, ObjectStoreError, ObjectUpload, StoredObject};
use crate::config::ObjectStoreConfig;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client as S3Client;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, instrument, warn};

/// Smallest part S3 accepts for every part except the last.
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// S3-backed object store.
///
/// Objects are keyed `{prefix}/{id}`. Payloads that fit in one part go up with
/// a single `PutObject`; larger ones use a multipart upload that is only
/// completed on finalize, so readers never observe a partial object.
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
    key_prefix: String,
    part_size: usize,
    chunk_size: usize,
}

impl S3ObjectStore {
    /// Create the store and verify the bucket is reachable.
    pub async fn new(config: &ObjectStoreConfig) -> Result<Self, ObjectStoreError> {
        let bucket = config
            .bucket
            .clone()
            .ok_or_else(|| ObjectStoreError::NotReady("no bucket configured".to_string()))?;

        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        let store = Self {
            client,
            bucket,
            key_prefix: config.key_prefix.trim_end_matches('/').to_string(),
            part_size: config.part_size_bytes.max(MIN_PART_SIZE),
            chunk_size: config.chunk_size_bytes.max(1),
        };

        store.health_check().await.map_err(|e| {
            ObjectStoreError::NotReady(format!("bucket {} is not reachable: {e}", store.bucket))
        })?;

        info!(
            bucket = %store.bucket,
            region = %config.region,
            "S3 object store initialized"
        );

        Ok(store)
    }

    fn object_key(&self, id: ObjectId) -> String {
        object_key(&self.key_prefix, id)
    }
}

fn object_key(prefix: &str, id: ObjectId) -> String {
    if prefix.is_empty() {
        id.to_string()
    } else {
        format!("{prefix}/{id}")
    }
}

fn backend_error<E>(context: &str, err: E) -> ObjectStoreError
where
    E: std::error::Error,
{
    ObjectStoreError::Backend(format!("{context}: {}", DisplayErrorContext(err)))
}

fn to_utc(time: Option<&aws_sdk_s3::primitives::DateTime>) -> DateTime<Utc> {
    time.and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos()))
        .unwrap_or_else(Utc::now)
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn open_upload(
        &self,
        filename: &str,
        content_type: &str,
    ) -> Result<Box<dyn ObjectUpload>, ObjectStoreError> {
        let id = ObjectId::new();
        Ok(Box::new(S3Upload {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key: self.object_key(id),
            id,
            filename: filename.to_string(),
            content_type: content_type.to_string(),
            part_size: self.part_size,
            buffer: BytesMut::new(),
            length: 0,
            multipart: None,
            finished: false,
        }))
    }

    #[instrument(skip(self), fields(object_id = %id))]
    async fn open_download(&self, id: ObjectId) -> Result<ObjectDownload, ObjectStoreError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.object_key(id))
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|e| e.is_no_such_key()).unwrap_or(false) {
                    ObjectStoreError::NotFound(id)
                } else {
                    backend_error("Failed to get object", e)
                }
            })?;

        let object = StoredObject {
            id,
            filename: output
                .metadata()
                .and_then(|m| m.get("filename").cloned())
                .unwrap_or_default(),
            content_type: output
                .content_type()
                .unwrap_or("application/octet-stream")
                .to_string(),
            length: output.content_length().unwrap_or_default().max(0) as u64,
            uploaded_at: to_utc(output.last_modified()),
        };

        let reader = output.body.into_async_read();
        let body = ReaderStream::with_capacity(reader, self.chunk_size)
            .map(move |chunk| {
                chunk.map_err(|e| ObjectStoreError::Backend(format!("Failed to read object {id}: {e}")))
            })
            .boxed();

        Ok(ObjectDownload { object, body })
    }

    async fn stat(&self, id: ObjectId) -> Result<Option<StoredObject>, ObjectStoreError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.object_key(id))
            .send()
            .await
        {
            Ok(head) => Ok(Some(StoredObject {
                id,
                filename: head
                    .metadata()
                    .and_then(|m| m.get("filename").cloned())
                    .unwrap_or_default(),
                content_type: head
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string(),
                length: head.content_length().unwrap_or_default().max(0) as u64,
                uploaded_at: to_utc(head.last_modified()),
            })),
            Err(e) => {
                if e.as_service_error().map(|e| e.is_not_found()).unwrap_or(false) {
                    Ok(None)
                } else {
                    Err(backend_error("Failed to check object existence", e))
                }
            }
        }
    }

    #[instrument(skip(self), fields(object_id = %id))]
    async fn delete(&self, id: ObjectId) -> Result<bool, ObjectStoreError> {
        // DeleteObject succeeds for absent keys, so look first to report existence
        if self.stat(id).await?.is_none() {
            debug!("Object already absent");
            return Ok(false);
        }

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.object_key(id))
            .send()
            .await
            .map_err(|e| backend_error("Failed to delete object", e))?;

        debug!("Object deleted from S3");
        Ok(true)
    }

    async fn health_check(&self) -> Result<(), ObjectStoreError> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| backend_error("Failed to reach bucket", e))?;
        Ok(())
    }
}

struct MultipartState {
    upload_id: String,
    parts: Vec<CompletedPart>,
}

struct S3Upload {
    client: S3Client,
    bucket: String,
    key: String,
    id: ObjectId,
    filename: String,
    content_type: String,
    part_size: usize,
    buffer: BytesMut,
    length: u64,
    multipart: Option<MultipartState>,
    finished: bool,
}

impl S3Upload {
    async fn start_multipart(&mut self) -> Result<(), ObjectStoreError> {
        let response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .content_type(&self.content_type)
            .metadata("filename", &self.filename)
            .send()
            .await
            .map_err(|e| backend_error("Failed to create multipart upload", e))?;

        let upload_id = response
            .upload_id()
            .ok_or_else(|| ObjectStoreError::Backend("No upload ID in response".to_string()))?
            .to_string();

        self.multipart = Some(MultipartState {
            upload_id,
            parts: Vec::new(),
        });
        Ok(())
    }

    async fn send_part(&mut self, body: Bytes) -> Result<(), ObjectStoreError> {
        if self.multipart.is_none() {
            self.start_multipart().await?;
        }
        let Some(state) = self.multipart.as_mut() else {
            return Err(ObjectStoreError::Backend("multipart upload not started".to_string()));
        };

        let part_number = state.parts.len() as i32 + 1;
        let response = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&state.upload_id)
            .part_number(part_number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| backend_error("Failed to upload part", e))?;

        state.parts.push(
            CompletedPart::builder()
                .part_number(part_number)
                .e_tag(response.e_tag().unwrap_or_default())
                .build(),
        );

        debug!(object_id = %self.id, part_number, "Uploaded part");
        Ok(())
    }

    async fn put_single(&mut self, body: Bytes) -> Result<(), ObjectStoreError> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .body(ByteStream::from(body))
            .content_type(&self.content_type)
            .metadata("filename", &self.filename)
            .send()
            .await
            .map_err(|e| backend_error("Failed to upload object", e))?;
        Ok(())
    }

    /// Complete the multipart upload. The state is kept on failure so that
    /// `abort` (or drop) can still release the uploaded parts.
    async fn complete_multipart(&mut self) -> Result<(), ObjectStoreError> {
        let Some(state) = self.multipart.as_ref() else {
            return Err(ObjectStoreError::Backend("multipart upload not started".to_string()));
        };

        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(state.parts.clone()))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&self.key)
            .upload_id(&state.upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| backend_error("Failed to complete multipart upload", e))?;

        self.multipart = None;
        Ok(())
    }
}

#[async_trait]
impl ObjectUpload for S3Upload {
    fn id(&self) -> ObjectId {
        self.id
    }

    async fn write(&mut self, chunk: Bytes) -> Result<(), ObjectStoreError> {
        if self.finished {
            return Err(ObjectStoreError::UploadClosed(self.id));
        }
        self.length += chunk.len() as u64;
        self.buffer.extend_from_slice(&chunk);

        while self.buffer.len() >= self.part_size {
            let part = self.buffer.split_to(self.part_size).freeze();
            self.send_part(part).await?;
        }
        Ok(())
    }

    async fn finalize(&mut self) -> Result<StoredObject, ObjectStoreError> {
        if self.finished {
            return Err(ObjectStoreError::UploadClosed(self.id));
        }

        let rest = std::mem::take(&mut self.buffer).freeze();
        if self.multipart.is_some() {
            if !rest.is_empty() {
                self.send_part(rest).await?;
            }
            self.complete_multipart().await?;
        } else {
            self.put_single(rest).await?;
        }
        self.finished = true;

        info!(
            object_id = %self.id,
            key = %self.key,
            length = self.length,
            "Object uploaded successfully"
        );

        Ok(StoredObject {
            id: self.id,
            filename: self.filename.clone(),
            content_type: self.content_type.clone(),
            length: self.length,
            uploaded_at: Utc::now(),
        })
    }

    async fn abort(&mut self) -> Result<(), ObjectStoreError> {
        self.finished = true;
        self.buffer.clear();

        if let Some(state) = self.multipart.take() {
            self.client
                .abort_multipart_upload()
                .bucket(&self.bucket)
                .key(&self.key)
                .upload_id(&state.upload_id)
                .send()
                .await
                .map_err(|e| backend_error("Failed to abort multipart upload", e))?;
        }
        Ok(())
    }
}

impl Drop for S3Upload {
    fn drop(&mut self) {
        let Some(state) = self.multipart.take() else {
            return;
        };
        // Dropped mid-upload: parts are invisible but still billed until aborted
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(object_id = %self.id, "Dropped multipart upload outside a runtime");
            return;
        };
        let client = self.client.clone();
        let bucket = self.bucket.clone();
        let key = self.key.clone();
        let id = self.id;
        handle.spawn(async move {
            if let Err(e) = client
                .abort_multipart_upload()
                .bucket(bucket)
                .key(key)
                .upload_id(state.upload_id)
                .send()
                .await
            {
                warn!(object_id = %id, error = %DisplayErrorContext(e), "Failed to abort dropped upload");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_sdk_s3::config::retry::RetryConfig;
    use aws_sdk_s3::config::{Credentials, Region};

    /// Client pointed at a closed local port, so every request fails fast.
    fn unreachable_client() -> S3Client {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .endpoint_url("http://127.0.0.1:1")
            .credentials_provider(Credentials::new("test", "test", None, None, "static"))
            .retry_config(RetryConfig::disabled())
            .force_path_style(true)
            .build();
        S3Client::from_conf(config)
    }

    fn multipart_upload() -> S3Upload {
        S3Upload {
            client: unreachable_client(),
            bucket: "photos".to_string(),
            key: "photos/object".to_string(),
            id: ObjectId::new(),
            filename: "capture.jpg".to_string(),
            content_type: "image/jpeg".to_string(),
            part_size: MIN_PART_SIZE,
            buffer: BytesMut::new(),
            length: MIN_PART_SIZE as u64,
            multipart: Some(MultipartState {
                upload_id: "upload-1".to_string(),
                parts: vec![CompletedPart::builder().part_number(1).e_tag("etag-1").build()],
            }),
            finished: false,
        }
    }

    #[tokio::test]
    async fn test_failed_completion_keeps_multipart_for_abort() {
        let mut upload = multipart_upload();

        assert!(upload.finalize().await.is_err());
        assert!(!upload.finished);
        let state = upload.multipart.as_ref().expect("multipart state retained");
        assert_eq!(state.upload_id, "upload-1");
        assert_eq!(state.parts.len(), 1);

        // Abort reaches the backend with the retained upload id
        assert!(upload.abort().await.is_err());
        assert!(upload.multipart.is_none());
    }

    #[test]
    fn test_object_key() {
        let id: ObjectId = "550e8400-e29b-41d4-a716-446655440000".parse().unwrap();
        assert_eq!(
            object_key("photos", id),
            "photos/550e8400-e29b-41d4-a716-446655440000"
        );
        assert_eq!(object_key("", id), "550e8400-e29b-41d4-a716-446655440000");
    }

    #[test]
    fn test_to_utc_falls_back_to_now() {
        let before = Utc::now();
        assert!(to_utc(None) >= before);

        let t = aws_sdk_s3::primitives::DateTime::from_secs(1_700_000_000);
        assert_eq!(to_utc(Some(&t)).timestamp(), 1_700_000_000);
    }
}
