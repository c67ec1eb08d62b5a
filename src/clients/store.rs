use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::models::dlq::{FailedEvent, FailedEventStatus, StoredFailedEvent};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Key-value backend for idempotency records.
///
/// `set` with `only_if_absent` must be atomic: of several concurrent callers
/// on one absent key, exactly one observes `true`. Expired entries behave as
/// absent even before they are physically purged.
#[async_trait]
pub trait DedupStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        only_if_absent: bool,
    ) -> StoreResult<bool>;

    async fn delete(&self, key: &str) -> StoreResult<u64>;

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Durable storage for dead-lettered events awaiting operator review.
#[async_trait]
pub trait FailureStore: Send + Sync {
    /// Inserts the event as `pending`, replacing an earlier copy with the same id.
    async fn save(&self, event: &FailedEvent) -> StoreResult<()>;

    async fn get(&self, event_id: &str) -> StoreResult<Option<StoredFailedEvent>>;

    async fn list(
        &self,
        status: Option<FailedEventStatus>,
        limit: usize,
    ) -> StoreResult<Vec<StoredFailedEvent>>;

    async fn update_status(
        &self,
        event_id: &str,
        status: FailedEventStatus,
        resolution_notes: Option<&str>,
    ) -> StoreResult<bool>;

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}
