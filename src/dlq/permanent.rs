use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;

/// A message that exhausted its retries. `id` is the DLQ id, so writing the
/// same failure twice is a no-op.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PermanentFailure {
    pub id: String,
    pub message_payload: serde_json::Value,
    pub error_message: String,
    pub error_type: String,
    pub retry_count: i32,
    pub first_failed_at: DateTime<Utc>,
    pub last_retry_at: DateTime<Utc>,
}

#[async_trait]
pub trait PermanentFailureStore: Send + Sync + 'static {
    /// Idempotent on `failure.id`.
    async fn insert(&self, failure: &PermanentFailure) -> Result<(), DatabaseError>;

    /// Most recent first.
    async fn list_recent(&self, limit: i64) -> Result<Vec<PermanentFailure>, DatabaseError>;
}

#[derive(Debug, Default)]
pub struct MemoryPermanentFailureStore {
    rows: Mutex<Vec<PermanentFailure>>,
    fail_next_writes: AtomicUsize,
}

impl MemoryPermanentFailureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next_writes(&self, count: usize) {
        self.fail_next_writes.store(count, Ordering::SeqCst);
    }

    pub fn rows(&self) -> Vec<PermanentFailure> {
        self.rows.lock().clone()
    }
}

#[async_trait]
impl PermanentFailureStore for MemoryPermanentFailureStore {
    async fn insert(&self, failure: &PermanentFailure) -> Result<(), DatabaseError> {
        let injected = self
            .fail_next_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(DatabaseError::Unavailable("injected failure".to_string()));
        }

        let mut rows = self.rows.lock();
        if !rows.iter().any(|row| row.id == failure.id) {
            rows.push(failure.clone());
        }
        Ok(())
    }

    async fn list_recent(&self, limit: i64) -> Result<Vec<PermanentFailure>, DatabaseError> {
        let mut rows = self.rows.lock().clone();
        rows.sort_by(|a, b| b.last_retry_at.cmp(&a.last_retry_at));
        rows.truncate(usize::try_from(limit.max(0)).unwrap_or(usize::MAX));
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn failure(id: &str, minutes_ago: i64) -> PermanentFailure {
        let at = Utc::now() - chrono::Duration::minutes(minutes_ago);
        PermanentFailure {
            id: id.to_string(),
            message_payload: serde_json::json!({ "message_id": id }),
            error_message: "503".to_string(),
            error_type: "pms_unavailable".to_string(),
            retry_count: 3,
            first_failed_at: at,
            last_retry_at: at,
        }
    }

    #[tokio::test]
    async fn test_insert_is_idempotent_on_id() {
        let store = MemoryPermanentFailureStore::new();
        store.insert(&failure("d1", 5)).await.unwrap();
        store.insert(&failure("d1", 1)).await.unwrap();
        assert_eq!(store.rows().len(), 1);
    }

    #[tokio::test]
    async fn test_list_recent_orders_newest_first() {
        let store = MemoryPermanentFailureStore::new();
        store.insert(&failure("old", 30)).await.unwrap();
        store.insert(&failure("new", 1)).await.unwrap();
        store.insert(&failure("mid", 10)).await.unwrap();

        let ids: Vec<String> = store
            .list_recent(2)
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.id)
            .collect();
        assert_eq!(ids, vec!["new", "mid"]);
    }

    #[tokio::test]
    async fn test_injected_write_failure() {
        let store = MemoryPermanentFailureStore::new();
        store.fail_next_writes(1);
        assert_matches!(
            store.insert(&failure("d1", 0)).await,
            Err(DatabaseError::Unavailable(_))
        );
        assert!(store.insert(&failure("d1", 0)).await.is_ok());
    }
}
