use crate::normalizer::NormalizeError;
use crate::object_store::{ObjectId, ObjectStoreError};
use crate::records::RecordStoreError;
use crate::staging::StagingError;
use thiserror::Error;

/// Errors surfaced by the upload and commit services.
///
/// Client-caused variants (`NoFile`, `UnsupportedFormat`, `Validation`,
/// `NoStagedImage`) are never retried by the service. The remaining variants
/// leave no partial state behind except where noted.
#[derive(Debug, Error)]
pub enum BoothError {
    #[error("No image data was provided")]
    NoFile,

    #[error("Unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("Image processing failed: {0}")]
    Processing(String),

    #[error("Object storage failed: {0}")]
    Storage(String),

    /// The object was written but the binding could not be saved.
    #[error("Failed to persist staged image {file_id} to session: {reason}")]
    SessionPersist { file_id: ObjectId, reason: String },

    #[error("Session store failed: {0}")]
    Session(String),

    #[error("No staged image for this session")]
    NoStagedImage,

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Record store failed: {0}")]
    RecordPersist(String),
}

impl BoothError {
    /// Whether the error was caused by the request rather than the system.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            BoothError::NoFile
                | BoothError::UnsupportedFormat(_)
                | BoothError::NoStagedImage
                | BoothError::Validation(_)
                | BoothError::NotFound(_)
        )
    }

    /// Stable machine-readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            BoothError::NoFile => "NO_FILE",
            BoothError::UnsupportedFormat(_) => "UNSUPPORTED_FORMAT",
            BoothError::Processing(_) => "PROCESSING_ERROR",
            BoothError::Storage(_) => "STORAGE_ERROR",
            BoothError::SessionPersist { .. } => "SESSION_PERSIST_ERROR",
            BoothError::Session(_) => "SESSION_ERROR",
            BoothError::NoStagedImage => "NO_STAGED_IMAGE",
            BoothError::Validation(_) => "VALIDATION_ERROR",
            BoothError::NotFound(_) => "NOT_FOUND",
            BoothError::RecordPersist(_) => "RECORD_PERSIST_ERROR",
        }
    }
}

impl From<NormalizeError> for BoothError {
    fn from(err: NormalizeError) -> Self {
        match err {
            NormalizeError::UnsupportedFormat(format) => BoothError::UnsupportedFormat(format),
            other => BoothError::Processing(other.to_string()),
        }
    }
}

impl From<ObjectStoreError> for BoothError {
    fn from(err: ObjectStoreError) -> Self {
        match err {
            ObjectStoreError::NotFound(id) => BoothError::NotFound(format!("object {id}")),
            other => BoothError::Storage(other.to_string()),
        }
    }
}

impl From<StagingError> for BoothError {
    fn from(err: StagingError) -> Self {
        BoothError::Session(err.to_string())
    }
}

impl From<RecordStoreError> for BoothError {
    fn from(err: RecordStoreError) -> Self {
        BoothError::RecordPersist(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_error_mapping() {
        let err: BoothError = NormalizeError::UnsupportedFormat("gif".to_string()).into();
        assert!(matches!(err, BoothError::UnsupportedFormat(ref f) if f == "gif"));

        let err: BoothError = NormalizeError::Decode("truncated".to_string()).into();
        assert!(matches!(err, BoothError::Processing(_)));
    }

    #[test]
    fn test_object_not_found_maps_to_not_found() {
        let id = ObjectId::new();
        let err: BoothError = ObjectStoreError::NotFound(id).into();
        assert_eq!(err.code(), "NOT_FOUND");
        assert!(err.is_client_error());

        let err: BoothError = ObjectStoreError::Backend("timeout".to_string()).into();
        assert_eq!(err.code(), "STORAGE_ERROR");
        assert!(!err.is_client_error());
    }
}
