use std::{fmt::Display, future::Future};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value as JsonValue;
use tokio::runtime::Handle;
use tracing::{debug, warn};

use crate::{
    idempotency::checker::IdempotencyChecker,
    models::idempotency::{IdempotencyKey, IdempotencyRecord, IdempotencyStatus},
};

const DROPPED_SCOPE_ERROR: &str = "processing scope dropped before completion";

/// Ownership of one idempotency key for the duration of a unit of work.
///
/// A scope that acquired the key and is dropped without `complete` or `fail`
/// marks the record failed in the background, so the key is never left in
/// PROCESSING.
pub struct IdempotencyScope {
    checker: IdempotencyChecker,
    key: IdempotencyKey,
    duplicate: bool,
    record: Option<IdempotencyRecord>,
    finished: bool,
}

impl IdempotencyScope {
    pub(crate) async fn acquire(checker: IdempotencyChecker, key: IdempotencyKey) -> Self {
        let (duplicate, record) = checker.is_duplicate(&key.key).await;
        if duplicate {
            return Self::duplicate(checker, key, record);
        }

        if checker
            .mark_processing(&key.key, &key.event_id, &key.event_type)
            .await
        {
            return Self {
                checker,
                key,
                duplicate: false,
                record: None,
                finished: false,
            };
        }

        // Lost the race; report whatever the winner has written.
        let (_, record) = checker.is_duplicate(&key.key).await;
        Self::duplicate(checker, key, record)
    }

    fn duplicate(
        checker: IdempotencyChecker,
        key: IdempotencyKey,
        record: Option<IdempotencyRecord>,
    ) -> Self {
        debug!(idempotency_key = %key.key, "Duplicate operation, skipping");

        Self {
            checker,
            key,
            duplicate: true,
            record,
            finished: true,
        }
    }

    pub fn key(&self) -> &IdempotencyKey {
        &self.key
    }

    pub fn is_duplicate(&self) -> bool {
        self.duplicate
    }

    /// True when another worker holds the key, including a failed key that
    /// is being re-acquired elsewhere.
    pub fn is_in_progress(&self) -> bool {
        self.duplicate && !self.is_completed()
    }

    /// True when the key was already processed to completion.
    pub fn is_completed(&self) -> bool {
        self.duplicate
            && self
                .record
                .as_ref()
                .is_some_and(|record| record.status == IdempotencyStatus::Completed)
    }

    pub fn record(&self) -> Option<&IdempotencyRecord> {
        self.record.as_ref()
    }

    pub fn cached_value(&self) -> Option<&JsonValue> {
        self.record.as_ref()?.result.as_ref()
    }

    pub fn cached_result<T: DeserializeOwned>(&self) -> Option<T> {
        let value = self.cached_value()?;

        match serde_json::from_value(value.clone()) {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(
                    idempotency_key = %self.key.key,
                    error = %e,
                    "Cached result does not match the expected type"
                );
                None
            }
        }
    }

    pub async fn complete(mut self, result: Option<JsonValue>) -> bool {
        if self.finished {
            return false;
        }
        self.finished = true;
        self.checker.mark_completed(&self.key.key, result).await
    }

    pub async fn fail(mut self, error: &str) -> bool {
        if self.finished {
            return false;
        }
        self.finished = true;
        self.checker.mark_failed(&self.key.key, error).await
    }

    /// Runs `work` under the scope: completes with its output or records its error.
    pub async fn run<Fut, T, E>(self, work: Fut) -> Result<T, E>
    where
        Fut: Future<Output = Result<T, E>>,
        T: Serialize,
        E: Display,
    {
        match work.await {
            Ok(output) => {
                let cached = match serde_json::to_value(&output) {
                    Ok(value) => Some(value),
                    Err(e) => {
                        warn!(
                            idempotency_key = %self.key.key,
                            error = %e,
                            "Result is not serializable, completing without cached value"
                        );
                        None
                    }
                };
                self.complete(cached).await;
                Ok(output)
            }
            Err(e) => {
                self.fail(&e.to_string()).await;
                Err(e)
            }
        }
    }
}

impl Drop for IdempotencyScope {
    fn drop(&mut self) {
        if self.finished {
            return;
        }

        let checker = self.checker.clone();
        let key = self.key.key.clone();

        match Handle::try_current() {
            Ok(handle) => {
                warn!(idempotency_key = %key, "Scope dropped unfinished, marking failed");
                handle.spawn(async move {
                    checker.mark_failed(&key, DROPPED_SCOPE_ERROR).await;
                });
            }
            Err(_) => {
                warn!(
                    idempotency_key = %key,
                    "Scope dropped outside a runtime, record stays PROCESSING until expiry"
                );
            }
        }
    }
}
