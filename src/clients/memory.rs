use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use tokio::{sync::Mutex, time::Instant};

use crate::{
    clients::store::{DedupStore, FailureStore, StoreError, StoreResult},
    models::dlq::{FailedEvent, FailedEventStatus, StoredFailedEvent},
};

struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

/// Process-local deduplication store for tests and single-node runs.
///
/// Expiry uses the tokio clock, so paused-time tests can advance past a TTL.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates an outage: every call fails until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        entries.values().filter(|e| e.expires_at > now).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl DedupStore for InMemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.check_available()?;

        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Duration,
        only_if_absent: bool,
    ) -> StoreResult<bool> {
        self.check_available()?;

        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        if only_if_absent
            && entries
                .get(key)
                .is_some_and(|existing| existing.expires_at > now)
        {
            return Ok(false);
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_vec(),
                expires_at: now + ttl,
            },
        );

        Ok(true)
    }

    async fn delete(&self, key: &str) -> StoreResult<u64> {
        self.check_available()?;

        let now = Instant::now();
        let mut entries = self.entries.lock().await;

        match entries.remove(key) {
            Some(entry) if entry.expires_at > now => Ok(1),
            _ => Ok(0),
        }
    }

    async fn ping(&self) -> StoreResult<()> {
        self.check_available()
    }
}

/// Failure store kept in memory, ordered by insertion.
#[derive(Clone, Default)]
pub struct InMemoryFailureStore {
    events: Arc<Mutex<Vec<StoredFailedEvent>>>,
}

impl InMemoryFailureStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.events.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.lock().await.is_empty()
    }
}

#[async_trait]
impl FailureStore for InMemoryFailureStore {
    async fn save(&self, event: &FailedEvent) -> StoreResult<()> {
        let now = Utc::now();
        let mut events = self.events.lock().await;

        let stored = StoredFailedEvent {
            event: event.clone(),
            status: FailedEventStatus::Pending,
            resolution_notes: None,
            stored_at: now,
            updated_at: now,
        };

        match events
            .iter_mut()
            .find(|existing| existing.event.event_id == event.event_id)
        {
            Some(existing) => {
                let stored_at = existing.stored_at;
                *existing = StoredFailedEvent { stored_at, ..stored };
            }
            None => events.push(stored),
        }

        Ok(())
    }

    async fn get(&self, event_id: &str) -> StoreResult<Option<StoredFailedEvent>> {
        let events = self.events.lock().await;
        Ok(events
            .iter()
            .find(|stored| stored.event.event_id == event_id)
            .cloned())
    }

    async fn list(
        &self,
        status: Option<FailedEventStatus>,
        limit: usize,
    ) -> StoreResult<Vec<StoredFailedEvent>> {
        let events = self.events.lock().await;
        Ok(events
            .iter()
            .filter(|stored| status.is_none_or(|s| stored.status == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn update_status(
        &self,
        event_id: &str,
        status: FailedEventStatus,
        resolution_notes: Option<&str>,
    ) -> StoreResult<bool> {
        let mut events = self.events.lock().await;

        match events
            .iter_mut()
            .find(|stored| stored.event.event_id == event_id)
        {
            Some(stored) => {
                stored.status = status;
                if let Some(notes) = resolution_notes {
                    stored.resolution_notes = Some(notes.to_string());
                }
                stored.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
