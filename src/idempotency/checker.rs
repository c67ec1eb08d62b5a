use std::{sync::Arc, time::Duration};

use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};

use crate::{
    clients::store::{DedupStore, StoreResult},
    idempotency::scope::IdempotencyScope,
    models::{
        idempotency::{
            IdempotencyConfig, IdempotencyKey, IdempotencyRecord, IdempotencyStatus,
            resolve_idempotency_key,
        },
        retry::RetryConfig,
    },
    utils::retry_with_backoff,
};

/// Upper bound on how long a failed key stays locked by one re-acquirer.
const REACQUIRE_LOCK_TTL: Duration = Duration::from_secs(30);

/// Check-and-set over a [`DedupStore`], owning the record state machine.
///
/// Store outages never block processing: acquisition succeeds and duplicate
/// checks report "not seen" while the store is unreachable.
#[derive(Clone)]
pub struct IdempotencyChecker {
    store: Arc<dyn DedupStore>,
    config: IdempotencyConfig,
    retry: RetryConfig,
}

impl IdempotencyChecker {
    pub fn new(store: Arc<dyn DedupStore>, config: IdempotencyConfig) -> Self {
        Self {
            store,
            config,
            retry: RetryConfig::default(),
        }
    }

    /// Backoff used for the terminal COMPLETED / FAILED writes.
    pub fn with_retry_config(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    pub fn storage_key(&self, idempotency_key: &str) -> String {
        format!("{}:{}", self.config.key_prefix, idempotency_key)
    }

    pub fn get_or_create_idempotency_key(event_id: &str, explicit_key: Option<&str>) -> String {
        resolve_idempotency_key(event_id, explicit_key)
    }

    /// Opens a scope that owns the key until it is completed, failed or dropped.
    pub async fn begin(&self, key: &IdempotencyKey) -> IdempotencyScope {
        IdempotencyScope::acquire(self.clone(), key.clone()).await
    }

    pub async fn get_record(&self, idempotency_key: &str) -> StoreResult<Option<IdempotencyRecord>> {
        self.load(&self.storage_key(idempotency_key)).await
    }

    async fn load(&self, storage_key: &str) -> StoreResult<Option<IdempotencyRecord>> {
        match self.store.get(storage_key).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn is_duplicate(&self, idempotency_key: &str) -> (bool, Option<IdempotencyRecord>) {
        match self.get_record(idempotency_key).await {
            Ok(Some(record)) => {
                let duplicate = record.is_duplicate();
                if duplicate {
                    debug!(
                        idempotency_key = %idempotency_key,
                        status = %record.status,
                        "Idempotency key already seen"
                    );
                }
                (duplicate, Some(record))
            }
            Ok(None) => (false, None),
            Err(e) => {
                warn!(
                    idempotency_key = %idempotency_key,
                    error = %e,
                    "Idempotency lookup failed, treating as new"
                );
                (false, None)
            }
        }
    }

    /// Claims the key for processing. Of concurrent callers exactly one wins.
    ///
    /// A FAILED record may be re-acquired. Each failure generation has its
    /// own lock key, so only one caller replaces the failed record.
    pub async fn mark_processing(
        &self,
        idempotency_key: &str,
        event_id: &str,
        event_type: &str,
    ) -> bool {
        let storage_key = self.storage_key(idempotency_key);
        let record = IdempotencyRecord::processing(idempotency_key, event_id, event_type);

        match self.try_create(&storage_key, &record).await {
            Ok(true) => {
                debug!(idempotency_key = %idempotency_key, "Marked as processing");
                true
            }
            Ok(false) => match self.reacquire_failed(&storage_key, record).await {
                Ok(acquired) => acquired,
                Err(e) => {
                    warn!(
                        idempotency_key = %idempotency_key,
                        error = %e,
                        "Idempotency store unavailable, processing anyway"
                    );
                    true
                }
            },
            Err(e) => {
                warn!(
                    idempotency_key = %idempotency_key,
                    error = %e,
                    "Idempotency store unavailable, processing anyway"
                );
                true
            }
        }
    }

    async fn try_create(&self, storage_key: &str, record: &IdempotencyRecord) -> StoreResult<bool> {
        let bytes = serde_json::to_vec(record)?;
        self.store
            .set(storage_key, &bytes, self.config.ttl(), true)
            .await
    }

    async fn reacquire_failed(
        &self,
        storage_key: &str,
        record: IdempotencyRecord,
    ) -> StoreResult<bool> {
        let existing = match self.load(storage_key).await? {
            Some(existing) => existing,
            // Expired between the two calls.
            None => return self.try_create(storage_key, &record).await,
        };

        if existing.status != IdempotencyStatus::Failed {
            debug!(
                idempotency_key = %record.idempotency_key,
                status = %existing.status,
                "Lost processing race"
            );
            return Ok(false);
        }

        let lock_key = retry_lock_key(storage_key, existing.generation);
        let lock_ttl = REACQUIRE_LOCK_TTL.min(self.config.ttl());
        let locked = self.store.set(&lock_key, b"1", lock_ttl, true).await?;

        if !locked {
            debug!(
                idempotency_key = %record.idempotency_key,
                generation = existing.generation,
                "Lost race to re-acquire failed key"
            );
            return Ok(false);
        }

        let generation = existing.generation + 1;
        let replaced = self
            .replace_failed(storage_key, &existing, record.with_generation(generation))
            .await;

        if replaced.is_err() {
            // Otherwise every later caller loses the lock race while the
            // record stays FAILED.
            if let Err(e) = self.store.delete(&lock_key).await {
                warn!(
                    idempotency_key = %existing.idempotency_key,
                    error = %e,
                    "Failed to release re-acquire lock, it expires on its own"
                );
            }
        }

        if replaced? {
            info!(
                idempotency_key = %existing.idempotency_key,
                generation,
                previous_error = existing.error.as_deref().unwrap_or_default(),
                "Re-acquired previously failed key"
            );
            return Ok(true);
        }
        Ok(false)
    }

    async fn replace_failed(
        &self,
        storage_key: &str,
        existing: &IdempotencyRecord,
        record: IdempotencyRecord,
    ) -> StoreResult<bool> {
        // The lock may have expired under a slow caller while another worker
        // moved the record on.
        let current = self.load(storage_key).await?;
        if current.is_none_or(|current| {
            current.status != IdempotencyStatus::Failed
                || current.generation != existing.generation
        }) {
            debug!(
                idempotency_key = %existing.idempotency_key,
                generation = existing.generation,
                "Failed record changed while re-acquiring"
            );
            return Ok(false);
        }

        let bytes = serde_json::to_vec(&record)?;
        self.store
            .set(storage_key, &bytes, self.config.ttl(), false)
            .await?;
        Ok(true)
    }

    pub async fn mark_completed(&self, idempotency_key: &str, result: Option<JsonValue>) -> bool {
        let completed = self
            .transition(idempotency_key, |record| record.complete(result))
            .await;

        if completed {
            debug!(idempotency_key = %idempotency_key, "Marked as completed");
        }
        completed
    }

    pub async fn mark_failed(&self, idempotency_key: &str, error: &str) -> bool {
        let failed = self
            .transition(idempotency_key, |record| record.fail(error))
            .await;

        if failed {
            debug!(idempotency_key = %idempotency_key, error = %error, "Marked as failed");
        }
        failed
    }

    async fn transition(
        &self,
        idempotency_key: &str,
        apply: impl FnOnce(&mut IdempotencyRecord),
    ) -> bool {
        let storage_key = self.storage_key(idempotency_key);

        let mut record = match retry_with_backoff(&self.retry, || self.load(&storage_key)).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(
                    idempotency_key = %idempotency_key,
                    "No idempotency record to update"
                );
                return false;
            }
            Err(e) => {
                error!(
                    idempotency_key = %idempotency_key,
                    error = %e,
                    "Failed to read idempotency record"
                );
                return false;
            }
        };

        if !record.is_in_progress() {
            warn!(
                idempotency_key = %idempotency_key,
                status = %record.status,
                "Idempotency record already finished"
            );
            return false;
        }

        apply(&mut record);

        let bytes = match serde_json::to_vec(&record) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(idempotency_key = %idempotency_key, error = %e, "Failed to encode record");
                return false;
            }
        };

        let ttl = self.config.ttl();
        match retry_with_backoff(&self.retry, || {
            self.store.set(&storage_key, &bytes, ttl, false)
        })
        .await
        {
            Ok(_) => true,
            Err(e) => {
                error!(
                    idempotency_key = %idempotency_key,
                    status = %record.status,
                    error = %e,
                    "Failed to persist idempotency record"
                );
                false
            }
        }
    }

    /// Removes the record and its re-acquire locks. Returns whether a record existed.
    pub async fn clear(&self, idempotency_key: &str) -> StoreResult<bool> {
        let storage_key = self.storage_key(idempotency_key);

        if let Some(record) = self.load(&storage_key).await? {
            for generation in 0..=record.generation {
                self.store
                    .delete(&retry_lock_key(&storage_key, generation))
                    .await?;
            }
        }

        let deleted = self.store.delete(&storage_key).await?;
        info!(idempotency_key = %idempotency_key, deleted, "Idempotency record cleared");

        Ok(deleted > 0)
    }
}

fn retry_lock_key(storage_key: &str, generation: u32) -> String {
    format!("{}:retry:{}", storage_key, generation)
}
