use std::{fmt::Display, future::Future};

use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::info;

use crate::{
    idempotency::checker::IdempotencyChecker,
    models::{event::EventEnvelope, idempotency::IdempotencyKey},
};

#[derive(Debug, Clone, Copy)]
pub struct IdempotencyOptions {
    /// Return the cached result (or nothing) for already completed keys
    /// instead of an error. Keys still being processed are never skipped.
    pub skip_on_duplicate: bool,
}

impl Default for IdempotencyOptions {
    fn default() -> Self {
        Self {
            skip_on_duplicate: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Idempotent<T> {
    Processed(T),
    /// Skipped; carries the earlier result when one was recorded.
    Duplicate(Option<T>),
}

impl<T> Idempotent<T> {
    pub fn was_processed(&self) -> bool {
        matches!(self, Idempotent::Processed(_))
    }

    pub fn into_inner(self) -> Option<T> {
        match self {
            Idempotent::Processed(value) => Some(value),
            Idempotent::Duplicate(cached) => cached,
        }
    }
}

#[derive(Debug, Error)]
pub enum IdempotencyError<E> {
    #[error("duplicate operation for idempotency key {key}")]
    Duplicate {
        key: String,
        cached_result: Option<JsonValue>,
        in_progress: bool,
    },

    #[error("{0}")]
    Handler(E),
}

/// An async function wrapped with deduplication on an idempotency key.
pub struct IdempotentFn<F> {
    checker: IdempotencyChecker,
    options: IdempotencyOptions,
    f: F,
}

pub fn idempotent<F>(checker: IdempotencyChecker, options: IdempotencyOptions, f: F) -> IdempotentFn<F> {
    IdempotentFn {
        checker,
        options,
        f,
    }
}

impl<F> IdempotentFn<F> {
    pub async fn call<A, Fut, T, E>(
        &self,
        key: &IdempotencyKey,
        arg: A,
    ) -> Result<Idempotent<T>, IdempotencyError<E>>
    where
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Serialize + DeserializeOwned,
        E: Display,
    {
        let scope = self.checker.begin(key).await;

        if scope.is_duplicate() {
            info!(
                idempotency_key = %key.key,
                in_progress = scope.is_in_progress(),
                "Skipping duplicate operation"
            );

            // A key still held elsewhere has no result to hand back yet.
            if self.options.skip_on_duplicate && scope.is_completed() {
                return Ok(Idempotent::Duplicate(scope.cached_result()));
            }

            return Err(IdempotencyError::Duplicate {
                key: key.key.clone(),
                cached_result: scope.cached_value().cloned(),
                in_progress: scope.is_in_progress(),
            });
        }

        scope
            .run((self.f)(arg))
            .await
            .map(Idempotent::Processed)
            .map_err(IdempotencyError::Handler)
    }
}

/// Runs `handler` once per idempotency key of `envelope`.
///
/// Returns `(false, cached)` for duplicates and `(true, Some(output))` after
/// processing. Handler errors are recorded on the key and returned.
pub async fn process_with_idempotency<F, Fut, T, E>(
    checker: &IdempotencyChecker,
    envelope: &EventEnvelope,
    handler: F,
) -> Result<(bool, Option<T>), E>
where
    F: FnOnce(EventEnvelope) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    T: Serialize + DeserializeOwned,
    E: Display,
{
    let key = IdempotencyKey::resolve(
        &envelope.event_id,
        envelope.idempotency_key.as_deref(),
        &envelope.event_type,
    );

    let scope = checker.begin(&key).await;
    if scope.is_duplicate() {
        info!(
            idempotency_key = %key.key,
            event_id = %envelope.event_id,
            "Event already processed, skipping"
        );
        return Ok((false, scope.cached_result()));
    }

    let output = scope.run(handler(envelope.clone())).await?;
    Ok((true, Some(output)))
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    };

    use serde_json::json;

    use super::*;
    use crate::{clients::memory::InMemoryStore, models::idempotency::IdempotencyConfig};

    fn checker() -> IdempotencyChecker {
        IdempotencyChecker::new(Arc::new(InMemoryStore::new()), IdempotencyConfig::default())
    }

    #[tokio::test]
    async fn test_completed_key_returns_cached_result() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let charge = idempotent(checker(), IdempotencyOptions::default(), move |amount: u32| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, String>(amount * 2)
            }
        });

        let key = IdempotencyKey::new("charge-1", "evt-1", "payment.requested");
        assert_eq!(charge.call(&key, 21).await.unwrap(), Idempotent::Processed(42));
        assert_eq!(charge.call(&key, 21).await.unwrap(), Idempotent::Duplicate(Some(42)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_key_reruns_handler() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let flaky = idempotent(checker(), IdempotencyOptions::default(), move |_: ()| {
            let counter = Arc::clone(&counter);
            async move {
                match counter.fetch_add(1, Ordering::SeqCst) {
                    0 => Err("downstream unavailable".to_string()),
                    _ => Ok("sent".to_string()),
                }
            }
        });

        let key = IdempotencyKey::new("notify-1", "evt-1", "user.created");
        let first = flaky.call(&key, ()).await;
        assert!(matches!(first, Err(IdempotencyError::Handler(_))));

        let second = flaky.call(&key, ()).await.unwrap();
        assert_eq!(second, Idempotent::Processed("sent".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_duplicate_signal_when_not_skipping() {
        let options = IdempotencyOptions {
            skip_on_duplicate: false,
        };
        let op = idempotent(checker(), options, |value: u32| async move {
            Ok::<_, String>(value)
        });

        let key = IdempotencyKey::new("op-1", "evt-1", "op");
        op.call(&key, 7).await.unwrap();

        match op.call(&key, 7).await {
            Err(IdempotencyError::Duplicate {
                key,
                cached_result,
                in_progress,
            }) => {
                assert_eq!(key, "op-1");
                assert_eq!(cached_result, Some(json!(7)));
                assert!(!in_progress);
            }
            other => panic!("expected duplicate signal, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_key_held_elsewhere_is_not_skipped() {
        let checker = checker();
        let _owner = checker
            .begin(&IdempotencyKey::new("op-2", "evt-2", "op"))
            .await;

        let op = idempotent(checker, IdempotencyOptions::default(), |value: u32| async move {
            Ok::<_, String>(value)
        });

        match op.call(&IdempotencyKey::new("op-2", "evt-2", "op"), 7).await {
            Err(IdempotencyError::Duplicate {
                cached_result,
                in_progress,
                ..
            }) => {
                assert!(in_progress);
                assert_eq!(cached_result, None);
            }
            other => panic!("expected duplicate signal, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_process_with_idempotency_uses_explicit_key() {
        let checker = checker();
        let first = EventEnvelope::new("order.created", json!({"order": 1}))
            .with_idempotency_key("order-1");
        let redelivered = EventEnvelope::new("order.created", json!({"order": 1}))
            .with_idempotency_key("order-1");

        let (processed, output) = process_with_idempotency(&checker, &first, |event| async move {
            Ok::<_, String>(event.data["order"].as_u64().unwrap_or_default())
        })
        .await
        .unwrap();
        assert!(processed);
        assert_eq!(output, Some(1));

        let (processed, output) =
            process_with_idempotency(&checker, &redelivered, |_| async move {
                Ok::<u64, String>(99)
            })
            .await
            .unwrap();
        assert!(!processed);
        assert_eq!(output, Some(1));
    }
}
