use crate::config::{NormalizeBounds, NormalizerConfig, StagingConfig};
use crate::error::BoothError;
use crate::normalizer::{self, NormalizedImage, SourceFormat, NORMALIZED_EXTENSION};
use crate::object_store::{self, ObjectDownload, ObjectId, ObjectStore};
use crate::records::RecordStore;
use crate::staging::{SessionId, StagingStore};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

const DATA_URL_PREFIX: &[u8] = b"data:";

/// Where the raw bytes came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadSource {
    /// A frame captured by the booth camera, possibly posted as a data URL
    Capture,
    /// A file chosen by the user with the mime type the client declared
    File { declared_mime: String },
}

impl UploadSource {
    fn label(&self) -> &'static str {
        match self {
            UploadSource::Capture => "capture",
            UploadSource::File { .. } => "upload",
        }
    }
}

/// Result of a successful stage
#[derive(Debug, Clone, Serialize)]
pub struct StagedImage {
    /// Object now bound to the session
    pub file_id: ObjectId,
    pub width: u32,
    pub height: u32,
    /// Size of the normalized payload in bytes
    pub size_bytes: u64,
    /// Object this upload replaced, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replaced: Option<ObjectId>,
}

/// Upload/selection service.
///
/// Camera captures and file uploads share one path: normalize, write the
/// object, then bind it to the session. The binding is only set after the
/// object is finalized. Objects already owned by a record are never deleted
/// from here, even when a binding still points at them.
pub struct UploadService {
    objects: Arc<dyn ObjectStore>,
    staging: Arc<dyn StagingStore>,
    records: Arc<dyn RecordStore>,
    bounds: NormalizerConfig,
    reap_replaced: bool,
    chunk_size: usize,
}

impl UploadService {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        staging: Arc<dyn StagingStore>,
        records: Arc<dyn RecordStore>,
        bounds: NormalizerConfig,
        staging_config: &StagingConfig,
        chunk_size: usize,
    ) -> Self {
        Self {
            objects,
            staging,
            records,
            bounds,
            reap_replaced: staging_config.reap_replaced,
            chunk_size,
        }
    }

    /// Stage a camera capture for the session.
    pub async fn select_from_capture(
        &self,
        session: &SessionId,
        raw: Bytes,
    ) -> Result<StagedImage, BoothError> {
        self.stage(session, UploadSource::Capture, raw).await
    }

    /// Stage an uploaded file for the session.
    pub async fn upload_file(
        &self,
        session: &SessionId,
        raw: Bytes,
        declared_mime: &str,
    ) -> Result<StagedImage, BoothError> {
        let source = UploadSource::File {
            declared_mime: declared_mime.to_string(),
        };
        self.stage(session, source, raw).await
    }

    /// Normalize `raw`, store it and bind it to the session.
    ///
    /// Success is only returned once the binding is durable.
    #[instrument(skip(self, raw), fields(session_id = %session, source = source.label(), input_bytes = raw.len()))]
    pub async fn stage(
        &self,
        session: &SessionId,
        source: UploadSource,
        raw: Bytes,
    ) -> Result<StagedImage, BoothError> {
        if raw.is_empty() {
            return Err(BoothError::NoFile);
        }

        let (raw, bounds) = match &source {
            UploadSource::Capture => (decode_capture(raw)?, self.bounds.capture),
            UploadSource::File { declared_mime } => {
                SourceFormat::from_declared_mime(declared_mime)?;
                (raw, self.bounds.upload)
            }
        };

        let image = normalize_blocking(raw, bounds).await?;
        debug!(
            width = image.width,
            height = image.height,
            original_width = image.original_width,
            original_height = image.original_height,
            "Normalized staged image"
        );

        let filename = format!(
            "{}-{}.{}",
            source.label(),
            Utc::now().format("%Y%m%dT%H%M%S%3f"),
            NORMALIZED_EXTENSION
        );
        let stored = object_store::put_object(
            self.objects.as_ref(),
            &filename,
            image.content_type(),
            image.data.clone(),
            self.chunk_size,
        )
        .await
        .map_err(|e| BoothError::Storage(e.to_string()))?;

        let replaced = match self.staging.set(session, stored.id).await {
            Ok(previous) => previous.filter(|previous| *previous != stored.id),
            Err(e) => {
                self.remove_unbound(stored.id, "binding persist failed").await;
                return Err(BoothError::SessionPersist {
                    file_id: stored.id,
                    reason: e.to_string(),
                });
            }
        };

        metrics::counter!("photobooth.uploads.staged").increment(1);
        info!(
            file_id = %stored.id,
            size_bytes = stored.length,
            replaced = ?replaced,
            "Staged image for session"
        );

        if let Some(previous) = replaced {
            if self.reap_replaced {
                self.remove_unbound(previous, "replaced by newer upload").await;
            } else {
                object_store::record_orphan(previous, "replaced by newer upload");
            }
        }

        Ok(StagedImage {
            file_id: stored.id,
            width: image.width,
            height: image.height,
            size_bytes: stored.length,
            replaced,
        })
    }

    /// Stream the image currently staged for the session.
    #[instrument(skip(self), fields(session_id = %session))]
    pub async fn preview(&self, session: &SessionId) -> Result<ObjectDownload, BoothError> {
        let file_id = self
            .staging
            .get(session)
            .await?
            .ok_or(BoothError::NoStagedImage)?;

        Ok(self.objects.open_download(file_id).await?)
    }

    /// Abandon the staged image: delete the object, then clear the binding.
    ///
    /// An object that a record already owns is left in place and only the
    /// binding is cleared. Returns `false` when nothing was staged.
    #[instrument(skip(self), fields(session_id = %session))]
    pub async fn discard(&self, session: &SessionId) -> Result<bool, BoothError> {
        let Some(file_id) = self.staging.get(session).await? else {
            return Ok(false);
        };

        if let Some(owner) = self.records.find_by_image(file_id).await? {
            info!(file_id = %file_id, record_id = %owner.id, "Staged image already committed, keeping object");
        } else if !self.objects.delete(file_id).await? {
            debug!(file_id = %file_id, "Staged object already absent");
        }
        self.staging.clear_if(session, file_id).await?;

        info!(file_id = %file_id, "Discarded staged image");
        Ok(true)
    }

    /// Best-effort delete of an object no binding points at.
    ///
    /// Skipped when a record owns the object. If ownership cannot be checked
    /// the object is kept and reported as a possible orphan.
    async fn remove_unbound(&self, id: ObjectId, reason: &str) {
        match self.records.find_by_image(id).await {
            Ok(None) => {}
            Ok(Some(owner)) => {
                debug!(object_id = %id, record_id = %owner.id, reason, "Object owned by record, not deleting");
                return;
            }
            Err(e) => {
                warn!(object_id = %id, error = %e, "Failed to check object ownership");
                object_store::record_orphan(id, reason);
                return;
            }
        }

        match self.objects.delete(id).await {
            Ok(_) => debug!(object_id = %id, reason, "Deleted unbound object"),
            Err(e) => {
                warn!(object_id = %id, error = %e, "Failed to delete unbound object");
                object_store::record_orphan(id, reason);
            }
        }
    }
}

/// Run the normalizer on the blocking pool.
async fn normalize_blocking(
    raw: Bytes,
    bounds: NormalizeBounds,
) -> Result<NormalizedImage, BoothError> {
    tokio::task::spawn_blocking(move || normalizer::normalize(&raw, bounds))
        .await
        .map_err(|e| BoothError::Processing(format!("normalizer task failed: {e}")))?
        .map_err(BoothError::from)
}

/// Unwrap a `data:image/...;base64,` capture. Raw image bytes pass through.
fn decode_capture(raw: Bytes) -> Result<Bytes, BoothError> {
    if !raw.starts_with(DATA_URL_PREFIX) {
        return Ok(raw);
    }

    let text = std::str::from_utf8(&raw)
        .map_err(|_| BoothError::Processing("data URL is not valid UTF-8".to_string()))?;
    let (header, payload) = text
        .split_once(',')
        .ok_or_else(|| BoothError::Processing("data URL has no payload".to_string()))?;

    let mut params = header["data:".len()..].split(';');
    let mime = params.next().unwrap_or_default();
    SourceFormat::from_declared_mime(mime)?;
    if !params.any(|p| p.eq_ignore_ascii_case("base64")) {
        return Err(BoothError::Processing(
            "data URL is not base64 encoded".to_string(),
        ));
    }

    let decoded = STANDARD
        .decode(payload.trim())
        .map_err(|e| BoothError::Processing(format!("invalid base64 capture: {e}")))?;
    if decoded.is_empty() {
        return Err(BoothError::NoFile);
    }

    Ok(Bytes::from(decoded))
}
