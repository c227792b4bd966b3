use crate::object_store::ObjectId;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use std::fmt;
use thiserror::Error;
use tracing::{debug, instrument};
use uuid::Uuid;

/// Opaque, already-authenticated session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Errors from staging binding operations.
#[derive(Debug, Error)]
pub enum StagingError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("staging backend error: {0}")]
    Backend(String),
}

/// Session-scoped slot holding at most one staged object id.
///
/// The binding points at the object a session is composing into a record.
/// It outlives individual requests and is only visible to its own session.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Bind `file_id` to the session, replacing any previous binding.
    ///
    /// Returns the replaced id. The replaced object is not deleted here.
    async fn set(&self, session: &SessionId, file_id: ObjectId) -> Result<Option<ObjectId>, StagingError>;

    /// Current binding, if any.
    async fn get(&self, session: &SessionId) -> Result<Option<ObjectId>, StagingError>;

    /// Remove the binding. Returns `true` if one existed.
    async fn clear(&self, session: &SessionId) -> Result<bool, StagingError>;

    /// Remove the binding only if it still holds `file_id`.
    async fn clear_if(&self, session: &SessionId, file_id: ObjectId) -> Result<bool, StagingError>;
}

/// In-memory staging store using `DashMap`. Suitable for development and testing.
#[derive(Default)]
pub struct MemoryStagingStore {
    bindings: DashMap<SessionId, ObjectId>,
}

impl MemoryStagingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StagingStore for MemoryStagingStore {
    async fn set(&self, session: &SessionId, file_id: ObjectId) -> Result<Option<ObjectId>, StagingError> {
        Ok(self.bindings.insert(session.clone(), file_id))
    }

    async fn get(&self, session: &SessionId) -> Result<Option<ObjectId>, StagingError> {
        Ok(self.bindings.get(session).map(|b| *b.value()))
    }

    async fn clear(&self, session: &SessionId) -> Result<bool, StagingError> {
        Ok(self.bindings.remove(session).is_some())
    }

    async fn clear_if(&self, session: &SessionId, file_id: ObjectId) -> Result<bool, StagingError> {
        Ok(self
            .bindings
            .remove_if(session, |_, bound| *bound == file_id)
            .is_some())
    }
}

/// PostgreSQL-backed staging store.
pub struct PgStagingStore {
    pool: PgPool,
}

impl PgStagingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StagingStore for PgStagingStore {
    #[instrument(skip(self), fields(session_id = %session, file_id = %file_id))]
    async fn set(&self, session: &SessionId, file_id: ObjectId) -> Result<Option<ObjectId>, StagingError> {
        let mut tx = self.pool.begin().await?;

        // First binding for the session: nothing was replaced
        let inserted = sqlx::query(
            r#"
            INSERT INTO staging_bindings (session_id, file_id, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (session_id) DO NOTHING
            "#,
        )
        .bind(session.as_str())
        .bind(file_id.as_uuid())
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 1 {
            tx.commit().await?;
            debug!(replaced = false, "Staging binding set");
            return Ok(None);
        }

        // The row exists now, so the lock serializes racing uploads and each
        // one sees the binding it replaces
        let previous: Option<Uuid> = sqlx::query_scalar(
            "SELECT file_id FROM staging_bindings WHERE session_id = $1 FOR UPDATE",
        )
        .bind(session.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        let statement = if previous.is_some() {
            "UPDATE staging_bindings SET file_id = $2, updated_at = NOW() WHERE session_id = $1"
        } else {
            // Cleared between the two statements
            r#"
            INSERT INTO staging_bindings (session_id, file_id, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (session_id)
            DO UPDATE SET file_id = EXCLUDED.file_id, updated_at = NOW()
            "#
        };
        sqlx::query(statement)
            .bind(session.as_str())
            .bind(file_id.as_uuid())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        debug!(replaced = previous.is_some(), "Staging binding set");

        Ok(previous.map(ObjectId::from_uuid))
    }

    async fn get(&self, session: &SessionId) -> Result<Option<ObjectId>, StagingError> {
        let file_id: Option<Uuid> =
            sqlx::query_scalar("SELECT file_id FROM staging_bindings WHERE session_id = $1")
                .bind(session.as_str())
                .fetch_optional(&self.pool)
                .await?;

        Ok(file_id.map(ObjectId::from_uuid))
    }

    async fn clear(&self, session: &SessionId) -> Result<bool, StagingError> {
        let result = sqlx::query("DELETE FROM staging_bindings WHERE session_id = $1")
            .bind(session.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn clear_if(&self, session: &SessionId, file_id: ObjectId) -> Result<bool, StagingError> {
        let result =
            sqlx::query("DELETE FROM staging_bindings WHERE session_id = $1 AND file_id = $2")
                .bind(session.as_str())
                .bind(file_id.as_uuid())
                .execute(&self.pool)
                .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_twice_keeps_last() {
        let store = MemoryStagingStore::new();
        let session = SessionId::new("s1");
        let first = ObjectId::new();
        let second = ObjectId::new();

        assert_eq!(store.set(&session, first).await.unwrap(), None);
        assert_eq!(store.set(&session, second).await.unwrap(), Some(first));
        assert_eq!(store.get(&session).await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let store = MemoryStagingStore::new();
        let a = SessionId::new("a");
        let b = SessionId::new("b");
        let id = ObjectId::new();

        store.set(&a, id).await.unwrap();
        assert_eq!(store.get(&b).await.unwrap(), None);
        assert!(!store.clear(&b).await.unwrap());
        assert_eq!(store.get(&a).await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn test_clear_if_only_matching() {
        let store = MemoryStagingStore::new();
        let session = SessionId::new("s1");
        let committed = ObjectId::new();
        let newer = ObjectId::new();

        store.set(&session, committed).await.unwrap();
        store.set(&session, newer).await.unwrap();

        assert!(!store.clear_if(&session, committed).await.unwrap());
        assert_eq!(store.get(&session).await.unwrap(), Some(newer));

        assert!(store.clear_if(&session, newer).await.unwrap());
        assert_eq!(store.get(&session).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_sets_resolve_to_one_winner() {
        let store = std::sync::Arc::new(MemoryStagingStore::new());
        let session = SessionId::new("race");
        let ids: Vec<ObjectId> = (0..16).map(|_| ObjectId::new()).collect();

        let handles: Vec<_> = ids
            .iter()
            .copied()
            .map(|id| {
                let store = store.clone();
                let session = session.clone();
                tokio::spawn(async move { store.set(&session, id).await.unwrap() })
            })
            .collect();
        let mut replaced = Vec::new();
        for handle in handles {
            replaced.push(handle.await.unwrap());
        }

        let winner = store.get(&session).await.unwrap().unwrap();
        assert!(ids.contains(&winner));

        // Exactly one set saw an empty slot, and every loser is reported once
        assert_eq!(replaced.iter().filter(|r| r.is_none()).count(), 1);
        let mut seen: Vec<ObjectId> = replaced.into_iter().flatten().collect();
        seen.push(winner);
        seen.sort_by_key(|id| id.as_uuid());
        let mut expected = ids.clone();
        expected.sort_by_key(|id| id.as_uuid());
        assert_eq!(seen, expected);
    }
}
