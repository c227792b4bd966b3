use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use image::{ImageFormat, RgbImage};
use tokio_test::{assert_err, assert_ok};

use photobooth::config::{NormalizerConfig, RecordsConfig, StagingConfig};
use photobooth::normalizer;
use photobooth::records::RecordMetadata;
use photobooth::{
    BoothError, CommitService, MemoryObjectStore, MemoryRecordStore, MemoryStagingStore,
    ObjectId, ObjectStore, RecordStore, SessionId, StagingStore, UploadService,
};
use photobooth::staging::StagingError;

// -- Helpers --------------------------------------------------------------

struct Booth {
    objects: Arc<MemoryObjectStore>,
    staging: Arc<MemoryStagingStore>,
    records: Arc<MemoryRecordStore>,
    uploads: UploadService,
    commits: CommitService,
}

fn booth() -> Booth {
    let objects = Arc::new(MemoryObjectStore::new(16 * 1024));
    let staging = Arc::new(MemoryStagingStore::new());
    let records = Arc::new(MemoryRecordStore::new());

    let uploads = UploadService::new(
        objects.clone(),
        staging.clone(),
        records.clone(),
        NormalizerConfig::default(),
        &StagingConfig::default(),
        16 * 1024,
    );
    let commits = CommitService::new(
        objects.clone(),
        staging.clone(),
        records.clone(),
        RecordsConfig::default(),
    );

    Booth {
        objects,
        staging,
        records,
        uploads,
        commits,
    }
}

/// Staging store whose first `clear_if` fails after the record is written.
struct FailFirstClear {
    inner: MemoryStagingStore,
    failed: AtomicBool,
}

#[async_trait]
impl StagingStore for FailFirstClear {
    async fn set(&self, session: &SessionId, file_id: ObjectId) -> Result<Option<ObjectId>, StagingError> {
        self.inner.set(session, file_id).await
    }

    async fn get(&self, session: &SessionId) -> Result<Option<ObjectId>, StagingError> {
        self.inner.get(session).await
    }

    async fn clear(&self, session: &SessionId) -> Result<bool, StagingError> {
        self.inner.clear(session).await
    }

    async fn clear_if(&self, session: &SessionId, file_id: ObjectId) -> Result<bool, StagingError> {
        if !self.failed.swap(true, Ordering::SeqCst) {
            return Err(StagingError::Backend("session store unavailable".to_string()));
        }
        self.inner.clear_if(session, file_id).await
    }
}

struct FlakyBooth {
    objects: Arc<MemoryObjectStore>,
    staging: Arc<FailFirstClear>,
    records: Arc<MemoryRecordStore>,
    uploads: UploadService,
    commits: CommitService,
}

fn flaky_booth() -> FlakyBooth {
    let objects = Arc::new(MemoryObjectStore::new(16 * 1024));
    let staging = Arc::new(FailFirstClear {
        inner: MemoryStagingStore::new(),
        failed: AtomicBool::new(false),
    });
    let records = Arc::new(MemoryRecordStore::new());

    let uploads = UploadService::new(
        objects.clone(),
        staging.clone(),
        records.clone(),
        NormalizerConfig::default(),
        &StagingConfig::default(),
        16 * 1024,
    );
    let commits = CommitService::new(
        objects.clone(),
        staging.clone(),
        records.clone(),
        RecordsConfig::default(),
    );

    FlakyBooth {
        objects,
        staging,
        records,
        uploads,
        commits,
    }
}

fn test_image(width: u32, height: u32, format: ImageFormat) -> Bytes {
    let img = RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x * 7 % 256) as u8, (y * 3 % 256) as u8, ((x + y) % 256) as u8])
    });
    let mut buffer = Cursor::new(Vec::new());
    img.write_to(&mut buffer, format).unwrap();
    Bytes::from(buffer.into_inner())
}

fn details(comment: Option<String>) -> RecordMetadata {
    RecordMetadata {
        member_name: "Grace Hopper".to_string(),
        contact: "grace@example.com".to_string(),
        comment,
        session_date: None,
    }
}

// -- Tests ----------------------------------------------------------------

#[tokio::test]
async fn large_png_upload_is_bounded_to_800_wide_jpeg() {
    let booth = booth();
    let session = SessionId::new("visitor-1");
    let raw = test_image(2000, 1000, ImageFormat::Png);

    let staged = assert_ok!(booth.uploads.upload_file(&session, raw.clone(), "image/png").await);
    assert_eq!((staged.width, staged.height), (800, 400));

    let expected = normalizer::normalize(&raw, NormalizerConfig::default().upload).unwrap();
    let preview = assert_ok!(booth.uploads.preview(&session).await);
    assert_eq!(preview.object.content_type, "image/jpeg");
    let body = preview.into_bytes().await.unwrap();

    assert_eq!(body, expected.data);
    assert_eq!(image::guess_format(&body).unwrap(), ImageFormat::Jpeg);
}

#[tokio::test]
async fn gif_upload_is_rejected_without_storing() {
    let booth = booth();
    let session = SessionId::new("visitor-1");

    let err = assert_err!(
        booth
            .uploads
            .upload_file(&session, test_image(20, 20, ImageFormat::Png), "image/gif")
            .await
    );

    assert!(matches!(err, BoothError::UnsupportedFormat(_)));
    assert!(booth.objects.is_empty());
    assert_eq!(booth.staging.get(&session).await.unwrap(), None);
}

#[tokio::test]
async fn commit_without_staged_image_creates_nothing() {
    let booth = booth();

    let err = assert_err!(
        booth
            .commits
            .commit(&SessionId::new("visitor-1"), details(None))
            .await
    );

    assert!(matches!(err, BoothError::NoStagedImage));
    assert_eq!(booth.records.count().await.unwrap(), 0);
}

#[tokio::test]
async fn capture_commit_stream_delete_lifecycle() {
    let booth = booth();
    let session = SessionId::new("visitor-1");

    let staged = assert_ok!(
        booth
            .uploads
            .select_from_capture(&session, test_image(640, 480, ImageFormat::Jpeg))
            .await
    );

    let record = assert_ok!(
        booth
            .commits
            .commit(&session, details(Some("Great day".to_string())))
            .await
    );
    assert_eq!(record.image_obj_id, Some(staged.file_id));
    assert_eq!(record.metadata.comment.as_deref(), Some("Great day"));
    assert_eq!(booth.staging.get(&session).await.unwrap(), None);
    assert_eq!(booth.records.count().await.unwrap(), 1);

    let stream = assert_ok!(booth.commits.stream(record.id).await);
    assert_eq!(stream.object.id, staged.file_id);
    assert_eq!(stream.into_bytes().await.unwrap().len() as u64, staged.size_bytes);

    assert_ok!(booth.commits.delete(record.id).await);
    assert!(!booth.objects.contains(staged.file_id));
    assert_eq!(booth.records.count().await.unwrap(), 0);

    let err = assert_err!(booth.commits.stream(record.id).await);
    assert!(matches!(err, BoothError::NotFound(_)));
}

#[tokio::test]
async fn overlong_comment_keeps_binding_for_retry() {
    let booth = booth();
    let session = SessionId::new("visitor-1");

    let staged = assert_ok!(
        booth
            .uploads
            .upload_file(&session, test_image(100, 100, ImageFormat::Png), "image/png")
            .await
    );

    let err = assert_err!(
        booth
            .commits
            .commit(&session, details(Some("x".repeat(501))))
            .await
    );
    assert!(matches!(err, BoothError::Validation(_)));
    assert_eq!(booth.records.count().await.unwrap(), 0);
    assert_eq!(booth.staging.get(&session).await.unwrap(), Some(staged.file_id));

    let record = assert_ok!(
        booth
            .commits
            .commit(&session, details(Some("x".repeat(500))))
            .await
    );
    assert_eq!(record.image_obj_id, Some(staged.file_id));
}

#[tokio::test]
async fn restaging_keeps_only_latest_binding() {
    let booth = booth();
    let session = SessionId::new("visitor-1");

    let first = assert_ok!(
        booth
            .uploads
            .select_from_capture(&session, test_image(64, 64, ImageFormat::Png))
            .await
    );
    let second = assert_ok!(
        booth
            .uploads
            .select_from_capture(&session, test_image(96, 64, ImageFormat::Png))
            .await
    );

    assert_eq!(booth.staging.get(&session).await.unwrap(), Some(second.file_id));
    assert_eq!(second.replaced, Some(first.file_id));

    let record = assert_ok!(booth.commits.commit(&session, details(None)).await);
    assert_eq!(record.image_obj_id, Some(second.file_id));
}

#[tokio::test]
async fn racing_uploads_leave_one_binding_and_one_object() {
    let booth = Arc::new(booth());
    let session = SessionId::new("visitor-1");

    let handles: Vec<_> = (0..6u32)
        .map(|i| {
            let booth = booth.clone();
            let session = session.clone();
            tokio::spawn(async move {
                booth
                    .uploads
                    .select_from_capture(&session, test_image(40 + i, 40, ImageFormat::Png))
                    .await
            })
        })
        .collect();

    let mut staged = Vec::new();
    for handle in handles {
        staged.push(handle.await.unwrap().unwrap());
    }

    let winner = booth.staging.get(&session).await.unwrap().unwrap();
    assert!(staged.iter().any(|s| s.file_id == winner));
    assert_eq!(booth.objects.len(), 1);
    assert!(booth.objects.contains(winner));
}

#[tokio::test]
async fn sessions_do_not_see_each_others_staging() {
    let booth = booth();
    let alice = SessionId::new("alice");
    let bob = SessionId::new("bob");

    assert_ok!(
        booth
            .uploads
            .select_from_capture(&alice, test_image(50, 50, ImageFormat::Png))
            .await
    );

    let err = assert_err!(booth.commits.commit(&bob, details(None)).await);
    assert!(matches!(err, BoothError::NoStagedImage));
    assert!(booth.staging.get(&alice).await.unwrap().is_some());
}

#[tokio::test]
async fn discarded_image_cannot_be_committed() {
    let booth = booth();
    let session = SessionId::new("visitor-1");

    let staged = assert_ok!(
        booth
            .uploads
            .select_from_capture(&session, test_image(50, 50, ImageFormat::Png))
            .await
    );
    assert!(assert_ok!(booth.uploads.discard(&session).await));
    assert!(!booth.objects.contains(staged.file_id));

    let err = assert_err!(booth.commits.commit(&session, details(None)).await);
    assert!(matches!(err, BoothError::NoStagedImage));
}

#[tokio::test]
async fn stale_binding_to_missing_object_is_dropped_on_commit() {
    let booth = booth();
    let session = SessionId::new("visitor-1");

    let staged = assert_ok!(
        booth
            .uploads
            .select_from_capture(&session, test_image(50, 50, ImageFormat::Png))
            .await
    );
    assert!(booth.objects.delete(staged.file_id).await.unwrap());

    let err = assert_err!(booth.commits.commit(&session, details(None)).await);
    assert!(matches!(err, BoothError::NoStagedImage));
    assert_eq!(booth.staging.get(&session).await.unwrap(), None);
}

#[tokio::test]
async fn reupload_after_failed_clear_keeps_committed_image() {
    let booth = flaky_booth();
    let session = SessionId::new("visitor-1");

    let staged = assert_ok!(
        booth
            .uploads
            .select_from_capture(&session, test_image(50, 50, ImageFormat::Png))
            .await
    );
    let err = assert_err!(booth.commits.commit(&session, details(None)).await);
    assert!(matches!(err, BoothError::Session(_)));

    let record = booth
        .records
        .find_by_image(staged.file_id)
        .await
        .unwrap()
        .expect("record was written before the clear failed");

    let replacement = assert_ok!(
        booth
            .uploads
            .select_from_capture(&session, test_image(60, 60, ImageFormat::Png))
            .await
    );
    assert_eq!(replacement.replaced, Some(staged.file_id));
    assert!(booth.objects.contains(staged.file_id));

    let stream = assert_ok!(booth.commits.stream(record.id).await);
    assert_eq!(stream.object.id, staged.file_id);
}

#[tokio::test]
async fn discard_after_failed_clear_keeps_committed_image() {
    let booth = flaky_booth();
    let session = SessionId::new("visitor-1");

    let staged = assert_ok!(
        booth
            .uploads
            .select_from_capture(&session, test_image(50, 50, ImageFormat::Png))
            .await
    );
    assert_err!(booth.commits.commit(&session, details(None)).await);
    let record = booth
        .records
        .find_by_image(staged.file_id)
        .await
        .unwrap()
        .expect("record was written before the clear failed");

    assert!(assert_ok!(booth.uploads.discard(&session).await));
    assert_eq!(booth.staging.get(&session).await.unwrap(), None);
    assert!(booth.objects.contains(staged.file_id));

    let stream = assert_ok!(booth.commits.stream(record.id).await);
    assert_eq!(stream.into_bytes().await.unwrap().len() as u64, staged.size_bytes);
}
