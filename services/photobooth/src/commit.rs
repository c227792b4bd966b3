use crate::config::RecordsConfig;
use crate::error::BoothError;
use crate::object_store::{ObjectDownload, ObjectId, ObjectStore};
use crate::records::{NewRecord, Record, RecordMetadata, RecordQuery, RecordStore, RecordStoreError};
use crate::staging::{SessionId, StagingStore};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// A page of records, newest first
#[derive(Debug, Clone, Serialize)]
pub struct RecordPage {
    pub records: Vec<Record>,
    pub total_count: i64,
    pub has_more: bool,
}

/// Commit service
pub struct CommitService {
    objects: Arc<dyn ObjectStore>,
    staging: Arc<dyn StagingStore>,
    records: Arc<dyn RecordStore>,
    limits: RecordsConfig,
}

impl CommitService {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        staging: Arc<dyn StagingStore>,
        records: Arc<dyn RecordStore>,
        limits: RecordsConfig,
    ) -> Self {
        Self {
            objects,
            staging,
            records,
            limits,
        }
    }

    /// Turn the session's staged image into a record.
    ///
    /// The binding is cleared only after the record is durable. If creating
    /// the record fails the binding is left as it was, so the caller can retry
    /// without uploading again. A retry after a failed clear returns the record
    /// that already owns the image.
    #[instrument(skip(self, metadata), fields(session_id = %session))]
    pub async fn commit(
        &self,
        session: &SessionId,
        metadata: RecordMetadata,
    ) -> Result<Record, BoothError> {
        let file_id = self
            .staging
            .get(session)
            .await?
            .ok_or(BoothError::NoStagedImage)?;

        let metadata = metadata.validate(&self.limits)?;

        if let Some(existing) = self.records.find_by_image(file_id).await? {
            info!(record_id = %existing.id, file_id = %file_id, "Staged image already committed");
            self.clear_binding(session, file_id).await?;
            return Ok(existing);
        }

        if self.objects.stat(file_id).await?.is_none() {
            warn!(file_id = %file_id, "Staged object is missing, dropping binding");
            self.clear_binding(session, file_id).await?;
            return Err(BoothError::NoStagedImage);
        }

        let new = NewRecord {
            metadata,
            image_obj_id: Some(file_id),
        };
        let record = match self.records.create(&new).await {
            Ok(record) => record,
            // A concurrent commit of the same binding won
            Err(RecordStoreError::ImageAlreadyOwned(_)) => self
                .records
                .find_by_image(file_id)
                .await?
                .ok_or_else(|| {
                    BoothError::RecordPersist(format!("owner of {file_id} vanished"))
                })?,
            Err(e) => return Err(e.into()),
        };

        self.clear_binding(session, file_id).await?;

        metrics::counter!("photobooth.records.committed").increment(1);
        info!(record_id = %record.id, file_id = %file_id, "Committed record");

        Ok(record)
    }

    /// Delete a record and the object it owns.
    ///
    /// The object goes first. If the record delete then fails the record
    /// dangles, and streaming it reports `NotFound`.
    #[instrument(skip(self))]
    pub async fn delete(&self, record_id: Uuid) -> Result<(), BoothError> {
        let record = self.get(record_id).await?;

        if let Some(image) = record.image_obj_id {
            if !self.objects.delete(image).await? {
                debug!(object_id = %image, "Record image already absent");
            }
        }

        match self.records.delete(record_id).await {
            Ok(true) => {}
            Ok(false) => debug!("Record removed concurrently"),
            Err(e) => {
                error!(error = %e, image = ?record.image_obj_id, "Record now references a deleted object");
                return Err(e.into());
            }
        }

        metrics::counter!("photobooth.records.deleted").increment(1);
        info!("Deleted record");
        Ok(())
    }

    /// Stream the image owned by a record.
    #[instrument(skip(self))]
    pub async fn stream(&self, record_id: Uuid) -> Result<ObjectDownload, BoothError> {
        let record = self.get(record_id).await?;
        let image = record
            .image_obj_id
            .ok_or_else(|| BoothError::NotFound(format!("record {record_id} has no image")))?;

        Ok(self.objects.open_download(image).await?)
    }

    pub async fn get(&self, record_id: Uuid) -> Result<Record, BoothError> {
        self.records
            .get(record_id)
            .await?
            .ok_or_else(|| BoothError::NotFound(format!("record {record_id}")))
    }

    /// List records newest first.
    pub async fn list(&self, query: &RecordQuery) -> Result<RecordPage, BoothError> {
        let records = self.records.list(query).await?;
        let total_count = self.records.count().await?;
        let offset = query.offset.unwrap_or(0).max(0);
        let has_more = offset + (records.len() as i64) < total_count;

        Ok(RecordPage {
            records,
            total_count,
            has_more,
        })
    }

    async fn clear_binding(&self, session: &SessionId, file_id: ObjectId) -> Result<(), BoothError> {
        match self.staging.clear_if(session, file_id).await {
            Ok(true) => Ok(()),
            Ok(false) => {
                debug!(file_id = %file_id, "Binding already moved on");
                Ok(())
            }
            Err(e) => {
                warn!(file_id = %file_id, error = %e, "Failed to clear staging binding");
                Err(e.into())
            }
        }
    }
}
