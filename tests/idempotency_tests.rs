use std::{
    sync::{
        Arc,
        atomic::{AtomicU32, Ordering},
    },
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use event_reliability::{
    clients::{
        memory::InMemoryStore,
        store::{DedupStore, StoreError, StoreResult},
    },
    idempotency::{
        Idempotent, IdempotencyChecker, IdempotencyOptions, idempotent, process_with_idempotency,
        with_idempotency,
    },
    models::{
        consumer::{ConsumerContext, ProcessingResult},
        event::{EventEnvelope, HEADER_EVENT_ID, Headers},
        idempotency::{IdempotencyConfig, IdempotencyKey, IdempotencyStatus},
    },
    workers::consumer::{MessageHandler, handler_fn},
};
use serde_json::json;
use tokio::time::advance;

/// Fails the next `failing_overwrites` plain writes; create-if-absent
/// writes and reads pass through.
#[derive(Clone, Default)]
struct FlakyStore {
    inner: InMemoryStore,
    failing_overwrites: Arc<AtomicU32>,
}

impl FlakyStore {
    fn fail_next_overwrites(&self, count: u32) {
        self.failing_overwrites.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl DedupStore for FlakyStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.inner.get(key).await
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        only_if_absent: bool,
    ) -> StoreResult<bool> {
        if !only_if_absent
            && self
                .failing_overwrites
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(StoreError::Unavailable("connection reset".to_string()));
        }
        self.inner.set(key, value, ttl, only_if_absent).await
    }

    async fn delete(&self, key: &str) -> StoreResult<u64> {
        self.inner.delete(key).await
    }
}

fn order_delivery(event_id: &str) -> ConsumerContext {
    let mut headers = Headers::new();
    headers.insert(HEADER_EVENT_ID.to_string(), event_id.to_string());

    ConsumerContext {
        subject: "events.order.created".to_string(),
        payload: br#"{"order_id": 7}"#.to_vec(),
        headers,
        attempt: 0,
        max_retries: 5,
    }
}

fn checker_with_ttl(store: &InMemoryStore, ttl_seconds: u64) -> IdempotencyChecker {
    IdempotencyChecker::new(
        Arc::new(store.clone()),
        IdempotencyConfig {
            ttl_seconds,
            key_prefix: "idempotency".to_string(),
        },
    )
}

/// Test: Exactly one of many concurrent callers acquires a key
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_mark_processing_has_one_winner() -> Result<()> {
    let store = InMemoryStore::new();
    let checker = checker_with_ttl(&store, 60);
    let idempotency_key = format!("test_concurrent_{}", uuid::Uuid::new_v4());

    let mut handles = vec![];
    for _ in 0..20 {
        let checker = checker.clone();
        let key = idempotency_key.clone();

        handles.push(tokio::spawn(async move {
            checker
                .mark_processing(&key, "evt-1", "order.created")
                .await
        }));
    }

    let results: Vec<bool> = futures_util::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let winners = results.iter().filter(|&&won| won).count();
    assert_eq!(winners, 1, "Exactly one task should acquire the key");

    Ok(())
}

/// Test: Concurrent re-acquirers of a failed key still produce one winner
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reacquire_of_failed_key() -> Result<()> {
    let store = InMemoryStore::new();
    let checker = checker_with_ttl(&store, 60);

    checker.mark_processing("order-9", "evt-9", "order.created").await;
    checker.mark_failed("order-9", "gateway timeout").await;

    let mut handles = vec![];
    for _ in 0..20 {
        let checker = checker.clone();
        handles.push(tokio::spawn(async move {
            checker
                .mark_processing("order-9", "evt-9", "order.created")
                .await
        }));
    }

    let winners = futures_util::future::join_all(handles)
        .await
        .into_iter()
        .filter(|r| matches!(r, Ok(true)))
        .count();
    assert_eq!(winners, 1);

    Ok(())
}

/// Test: Records move PROCESSING -> COMPLETED and keep their result
#[tokio::test]
async fn test_record_state_transitions() -> Result<()> {
    let store = InMemoryStore::new();
    let checker = checker_with_ttl(&store, 60);

    let (duplicate, record) = checker.is_duplicate("test_states").await;
    assert!(!duplicate);
    assert!(record.is_none());

    checker
        .mark_processing("test_states", "evt-1", "order.created")
        .await;
    let record = checker.get_record("test_states").await?.unwrap();
    assert_eq!(record.status, IdempotencyStatus::Processing);
    assert_eq!(record.event_type, "order.created");

    checker
        .mark_completed("test_states", Some(json!({"invoice": "INV-1"})))
        .await;
    let record = checker.get_record("test_states").await?.unwrap();
    assert_eq!(record.status, IdempotencyStatus::Completed);
    assert_eq!(record.result, Some(json!({"invoice": "INV-1"})));

    Ok(())
}

/// Test: Records are stored as JSON under the configured prefix
#[tokio::test]
async fn test_records_stored_under_prefix() -> Result<()> {
    let store = InMemoryStore::new();
    let checker = checker_with_ttl(&store, 60);

    checker.mark_processing("abc", "evt-1", "order.created").await;

    let raw = store.get("idempotency:abc").await?.unwrap();
    let value: serde_json::Value = serde_json::from_slice(&raw)?;
    assert_eq!(value["status"], json!("PROCESSING"));
    assert_eq!(value["idempotency_key"], json!("abc"));

    Ok(())
}

/// Test: Keys expire after the TTL even before they are purged
#[tokio::test(start_paused = true)]
async fn test_idempotency_keys_expire_after_ttl() -> Result<()> {
    let store = InMemoryStore::new();
    let checker = checker_with_ttl(&store, 2);

    checker.mark_processing("ttl_key", "evt-1", "order.created").await;
    checker.mark_completed("ttl_key", None).await;
    assert!(checker.is_duplicate("ttl_key").await.0);

    advance(Duration::from_secs(3)).await;

    assert_eq!(checker.is_duplicate("ttl_key").await, (false, None));
    assert!(
        checker
            .mark_processing("ttl_key", "evt-2", "order.created")
            .await
    );

    Ok(())
}

/// Test: The wrapper returns the cached result for a completed key without re-running
#[tokio::test]
async fn test_completed_key_is_not_reprocessed() -> Result<()> {
    let store = InMemoryStore::new();
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);

    let send_invoice = idempotent(
        checker_with_ttl(&store, 60),
        IdempotencyOptions::default(),
        move |order_id: u32| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, anyhow::Error>(format!("INV-{}", order_id))
            }
        },
    );

    let key = IdempotencyKey::resolve("evt-1", Some("invoice-order-7"), "order.completed");
    let first = send_invoice.call(&key, 7).await?;
    let second = send_invoice.call(&key, 7).await?;

    assert!(first.was_processed());
    assert_eq!(second, Idempotent::Duplicate(Some("INV-7".to_string())));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    Ok(())
}

/// Test: The wrapper re-runs the handler for a key whose last attempt failed
#[tokio::test]
async fn test_failed_key_is_reprocessed() -> Result<()> {
    let store = InMemoryStore::new();
    let checker = checker_with_ttl(&store, 60);
    let calls = Arc::new(AtomicU32::new(0));

    let envelope = EventEnvelope::new("order.completed", json!({"order_id": 7}))
        .with_idempotency_key("invoice-order-7");

    for expected_calls in 1..=2u32 {
        let counter = Arc::clone(&calls);
        let outcome = process_with_idempotency(&checker, &envelope, |_| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err::<String, _>(anyhow::anyhow!("mail server unavailable"))
        })
        .await;

        assert!(outcome.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), expected_calls);
    }

    let record = checker.get_record("invoice-order-7").await?.unwrap();
    assert_eq!(record.status, IdempotencyStatus::Failed);
    assert_eq!(record.generation, 1);

    Ok(())
}

/// Test: Store outages do not block processing
#[tokio::test]
async fn test_store_outage_fails_open() -> Result<()> {
    let store = InMemoryStore::new();
    store.set_unavailable(true);
    let checker = checker_with_ttl(&store, 60);

    let envelope = EventEnvelope::new("order.created", json!({}));
    let (processed, output) = process_with_idempotency(&checker, &envelope, |_| async move {
        Ok::<_, anyhow::Error>(1u8)
    })
    .await?;

    assert!(processed);
    assert_eq!(output, Some(1));

    Ok(())
}

/// Test: A failed key is processed again after a store error interrupts its re-acquisition
#[tokio::test]
async fn test_interrupted_reacquire_does_not_swallow_redeliveries() -> Result<()> {
    let store = FlakyStore::default();
    let checker = IdempotencyChecker::new(Arc::new(store.clone()), IdempotencyConfig::default());
    let calls = Arc::new(AtomicU32::new(0));

    let counter = Arc::clone(&calls);
    let handler = with_idempotency(
        checker.clone(),
        handler_fn(move |_ctx: ConsumerContext| {
            let counter = Arc::clone(&counter);
            async move {
                // The first two deliveries hit a downstream outage.
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Ok(ProcessingResult::retry("payment gateway unavailable"))
                } else {
                    Ok(ProcessingResult::Success)
                }
            }
        }),
        IdempotencyOptions::default(),
    );

    let delivery = order_delivery("evt-7");
    let first = handler.handle(&delivery).await?;
    assert!(matches!(first, ProcessingResult::Retry(_)));

    // The redelivery takes the re-acquire lock, then its overwrite fails.
    store.fail_next_overwrites(1);
    let second = handler.handle(&delivery).await?;
    assert!(matches!(second, ProcessingResult::Retry(_)));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let third = handler.handle(&delivery).await?;
    assert_eq!(third, ProcessingResult::Success);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let fourth = handler.handle(&delivery).await?;
    assert_eq!(fourth, ProcessingResult::Success);
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let record = checker.get_record("evt-7").await?.unwrap();
    assert_eq!(record.status, IdempotencyStatus::Completed);
    assert_eq!(record.generation, 1);

    Ok(())
}

/// Test: A failed key whose re-acquirer vanished is retried, not acked, until its lock expires
#[tokio::test(start_paused = true)]
async fn test_failed_key_with_held_lock_is_retried() -> Result<()> {
    let store = InMemoryStore::new();
    let checker = checker_with_ttl(&store, 3_600);
    let calls = Arc::new(AtomicU32::new(0));

    checker.mark_processing("evt-8", "evt-8", "events.order.created").await;
    checker.mark_failed("evt-8", "worker crashed").await;
    store
        .set("idempotency:evt-8:retry:0", b"1", Duration::from_secs(30), true)
        .await?;

    let counter = Arc::clone(&calls);
    let handler = with_idempotency(
        checker,
        handler_fn(move |_ctx: ConsumerContext| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(ProcessingResult::Success)
            }
        }),
        IdempotencyOptions::default(),
    );

    let delivery = order_delivery("evt-8");
    assert_eq!(
        handler.handle(&delivery).await?,
        ProcessingResult::retry("processing elsewhere")
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    advance(Duration::from_secs(31)).await;

    assert_eq!(handler.handle(&delivery).await?, ProcessingResult::Success);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    Ok(())
}
