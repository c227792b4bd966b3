use crate::config::RecordsConfig;
use crate::error::BoothError;
use crate::object_store::ObjectId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::FromRow;
use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

/// User-entered metadata for a photo record.
///
/// Serialized in camelCase; snake_case names are still accepted on input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordMetadata {
    /// Name of the person in the photo
    #[serde(default, alias = "member_name")]
    pub member_name: String,
    /// How to reach them (email or phone)
    #[serde(default)]
    pub contact: String,
    /// Free-text comment
    #[serde(default)]
    pub comment: Option<String>,
    /// When the photo session took place
    #[serde(default, alias = "session_date")]
    pub session_date: Option<DateTime<Utc>>,
}

impl RecordMetadata {
    /// Check required fields and length bounds, returning trimmed metadata.
    pub fn validate(self, limits: &RecordsConfig) -> Result<Self, BoothError> {
        let member_name = required_field("memberName", &self.member_name, limits.max_field_chars)?;
        let contact = required_field("contact", &self.contact, limits.max_field_chars)?;

        let comment = match self.comment.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(comment) => {
                let len = comment.chars().count();
                if len > limits.max_comment_chars {
                    return Err(BoothError::Validation(format!(
                        "comment is {len} characters, maximum is {}",
                        limits.max_comment_chars
                    )));
                }
                reject_markup("comment", comment)?;
                Some(comment.to_string())
            }
        };

        Ok(Self {
            member_name,
            contact,
            comment,
            session_date: self.session_date,
        })
    }
}

fn required_field(name: &str, value: &str, max_chars: usize) -> Result<String, BoothError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(BoothError::Validation(format!("{name} is required")));
    }
    if value.chars().count() > max_chars {
        return Err(BoothError::Validation(format!(
            "{name} must be at most {max_chars} characters"
        )));
    }
    reject_markup(name, value)?;
    Ok(value.to_string())
}

fn reject_markup(name: &str, value: &str) -> Result<(), BoothError> {
    if value.contains(|c: char| c == '<' || c == '>') {
        return Err(BoothError::Validation(format!("{name} must not include HTML")));
    }
    Ok(())
}

/// A committed photo record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Unique record ID
    pub id: Uuid,
    #[serde(flatten)]
    pub metadata: RecordMetadata,
    /// Permanent image owned by this record
    pub image_obj_id: Option<ObjectId>,
    /// When the record was created
    pub created_at: DateTime<Utc>,
}

/// Input for creating a record
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub metadata: RecordMetadata,
    pub image_obj_id: Option<ObjectId>,
}

/// Query parameters for listing records
#[derive(Debug, Clone, Default)]
pub struct RecordQuery {
    /// Maximum number of results
    pub limit: Option<i64>,
    /// Offset for pagination
    pub offset: Option<i64>,
}

/// Errors from record store operations.
#[derive(Debug, Error)]
pub enum RecordStoreError {
    #[error("object {0} is already owned by another record")]
    ImageAlreadyOwned(ObjectId),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Durable collection of committed records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Persist a new record. Returns once the write is durable.
    async fn create(&self, record: &NewRecord) -> Result<Record, RecordStoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<Record>, RecordStoreError>;

    /// The record owning `image`, if any.
    async fn find_by_image(&self, image: ObjectId) -> Result<Option<Record>, RecordStoreError>;

    /// Delete a record. Returns `true` if it existed.
    async fn delete(&self, id: Uuid) -> Result<bool, RecordStoreError>;

    /// Records ordered newest first.
    async fn list(&self, query: &RecordQuery) -> Result<Vec<Record>, RecordStoreError>;

    async fn count(&self) -> Result<i64, RecordStoreError>;
}

/// In-memory record store using `DashMap`. Suitable for development and testing.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: DashMap<Uuid, Record>,
    /// Secondary index: image object -> owning record
    image_index: DashMap<ObjectId, Uuid>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn create(&self, new: &NewRecord) -> Result<Record, RecordStoreError> {
        let record = Record {
            id: Uuid::new_v4(),
            metadata: new.metadata.clone(),
            image_obj_id: new.image_obj_id,
            created_at: Utc::now(),
        };

        let Some(image) = new.image_obj_id else {
            self.records.insert(record.id, record.clone());
            return Ok(record);
        };

        // The index entry stays locked until the record is visible, so a
        // losing create always finds the owner
        match self.image_index.entry(image) {
            Entry::Occupied(_) => Err(RecordStoreError::ImageAlreadyOwned(image)),
            Entry::Vacant(slot) => {
                self.records.insert(record.id, record.clone());
                slot.insert(record.id);
                Ok(record)
            }
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Record>, RecordStoreError> {
        Ok(self.records.get(&id).map(|r| r.value().clone()))
    }

    async fn find_by_image(&self, image: ObjectId) -> Result<Option<Record>, RecordStoreError> {
        let Some(id) = self.image_index.get(&image).map(|r| *r.value()) else {
            return Ok(None);
        };
        Ok(self.records.get(&id).map(|r| r.value().clone()))
    }

    async fn delete(&self, id: Uuid) -> Result<bool, RecordStoreError> {
        let Some((_, record)) = self.records.remove(&id) else {
            return Ok(false);
        };
        if let Some(image) = record.image_obj_id {
            self.image_index.remove(&image);
        }
        Ok(true)
    }

    async fn list(&self, query: &RecordQuery) -> Result<Vec<Record>, RecordStoreError> {
        let mut records: Vec<Record> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));

        let offset = query.offset.unwrap_or(0).max(0) as usize;
        let limit = query.limit.map(|l| l.max(0) as usize).unwrap_or(usize::MAX);
        Ok(records.into_iter().skip(offset).take(limit).collect())
    }

    async fn count(&self) -> Result<i64, RecordStoreError> {
        Ok(self.records.len() as i64)
    }
}

/// Record row as stored in PostgreSQL
#[derive(Debug, FromRow)]
struct RecordRow {
    id: Uuid,
    member_name: String,
    contact: String,
    comment: Option<String>,
    session_date: Option<DateTime<Utc>>,
    image_obj_id: Option<Uuid>,
    created_at: DateTime<Utc>,
}

impl From<RecordRow> for Record {
    fn from(row: RecordRow) -> Self {
        Self {
            id: row.id,
            metadata: RecordMetadata {
                member_name: row.member_name,
                contact: row.contact,
                comment: row.comment,
                session_date: row.session_date,
            },
            image_obj_id: row.image_obj_id.map(ObjectId::from_uuid),
            created_at: row.created_at,
        }
    }
}

/// PostgreSQL-backed record store
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    #[instrument(skip(self, new), fields(image_obj_id = ?new.image_obj_id))]
    async fn create(&self, new: &NewRecord) -> Result<Record, RecordStoreError> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            INSERT INTO photo_records (
                id, member_name, contact, comment, session_date,
                image_obj_id, created_at
            ) VALUES (
                $1, $2, $3, $4, $5, $6, NOW()
            )
            RETURNING id, member_name, contact, comment, session_date,
                      image_obj_id, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.metadata.member_name)
        .bind(&new.metadata.contact)
        .bind(&new.metadata.comment)
        .bind(new.metadata.session_date)
        .bind(new.image_obj_id.map(|id| id.as_uuid()))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            let owned = match (new.image_obj_id, e.as_database_error()) {
                (Some(image), Some(db)) if db.is_unique_violation() => Some(image),
                _ => None,
            };
            match owned {
                Some(image) => RecordStoreError::ImageAlreadyOwned(image),
                None => RecordStoreError::Database(e),
            }
        })?;

        debug!(record_id = %row.id, "Record created");

        Ok(row.into())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Record>, RecordStoreError> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT id, member_name, contact, comment, session_date,
                   image_obj_id, created_at
            FROM photo_records
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    async fn find_by_image(&self, image: ObjectId) -> Result<Option<Record>, RecordStoreError> {
        let row = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT id, member_name, contact, comment, session_date,
                   image_obj_id, created_at
            FROM photo_records
            WHERE image_obj_id = $1
            "#,
        )
        .bind(image.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: Uuid) -> Result<bool, RecordStoreError> {
        let result = sqlx::query("DELETE FROM photo_records WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list(&self, query: &RecordQuery) -> Result<Vec<Record>, RecordStoreError> {
        let rows = sqlx::query_as::<_, RecordRow>(
            r#"
            SELECT id, member_name, contact, comment, session_date,
                   image_obj_id, created_at
            FROM photo_records
            ORDER BY created_at DESC, id DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(query.limit)
        .bind(query.offset.unwrap_or(0))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn count(&self) -> Result<i64, RecordStoreError> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM photo_records")
            .fetch_one(&self.pool)
            .await?;

        Ok(count.0)
    }
}
