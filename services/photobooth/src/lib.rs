//! Photobooth Service
//!
//! Staged photo upload and record service for the photobooth. A session
//! captures or uploads an image, which is normalized and parked as the
//! session's staged image. Submitting the details form commits the staged
//! image into a permanent record.
//!
//! ## Features
//!
//! - **One staging path**: camera captures (raw or data URL) and file uploads
//!   share normalization, storage and binding
//! - **Bounded images**: JPEG/PNG input is downscaled to a maximum width and
//!   re-encoded as JPEG
//! - **Streamed object storage**: S3 multipart uploads and chunked downloads,
//!   or an in-memory store for development
//! - **Retry-safe commit**: the staged binding is cleared only after the record
//!   is durable, and retries return the record that already owns the image
//!
//! ## Architecture
//!
//! ```text
//!   HTTP (axum)
//!  ┌──────────────┐     ┌──────────────┐     ┌──────────────┐
//!  │ /photosession│────▶│ Upload       │────▶│ Normalizer   │
//!  │ /api/sessions│     │ Service      │     └──────────────┘
//!  └──────────────┘     └──────────────┘
//!         │                │        │
//!         │                ▼        ▼
//!         │      ┌──────────────┐ ┌──────────────┐
//!         │      │ Object Store │ │ Staging      │
//!         │      │ (S3/memory)  │ │ Bindings     │
//!         │      └──────────────┘ └──────────────┘
//!         │                ▲        ▲
//!         ▼                │        │
//!  ┌──────────────┐        │        │
//!  │ Commit       │────────┴────────┘
//!  │ Service      │────▶ Record Store (PostgreSQL/memory)
//!  └──────────────┘
//! ```

pub mod api;
pub mod commit;
pub mod config;
pub mod database;
pub mod error;
pub mod normalizer;
pub mod object_store;
pub mod records;
pub mod staging;
pub mod upload;

pub use api::{create_router, AppState};
pub use commit::{CommitService, RecordPage};
pub use config::Config;
pub use error::BoothError;
pub use object_store::{MemoryObjectStore, ObjectId, ObjectStore, S3ObjectStore};
pub use records::{MemoryRecordStore, PgRecordStore, Record, RecordMetadata, RecordStore};
pub use staging::{MemoryStagingStore, PgStagingStore, SessionId, StagingStore};
pub use upload::{StagedImage, UploadService, UploadSource};
