use std::{
    collections::{HashMap, VecDeque},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::{Mutex, Notify},
    time::{Instant, timeout_at},
};
use tracing::debug;

use crate::{
    clients::broker::{
        Acker, Broker, BrokerError, BrokerMessage, BrokerResult, Subscription, subject_matches,
    },
    models::event::Headers,
};

#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub published: usize,
    pub acked: usize,
    pub naked: usize,
}

#[derive(Clone)]
struct Pending {
    id: u64,
    subject: String,
    payload: Vec<u8>,
    headers: Headers,
    deliveries: u32,
}

struct Queue {
    filter: String,
    ready: VecDeque<Pending>,
    in_flight: HashMap<u64, Pending>,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, Queue>,
    published: Vec<PublishedMessage>,
    stats: BrokerStats,
    next_id: u64,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    notify: Notify,
    fail_publishes: AtomicBool,
    closed: AtomicBool,
}

/// Broker kept in process memory with durable-queue semantics.
///
/// A new durable subscription starts with every previously published message
/// matching its filter. Nak'ed and unsubscribed-while-in-flight messages are
/// redelivered.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every publish fail until cleared.
    pub fn set_fail_publishes(&self, fail: bool) {
        self.inner.fail_publishes.store(fail, Ordering::SeqCst);
    }

    pub async fn stats(&self) -> BrokerStats {
        self.inner.state.lock().await.stats
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.inner.state.lock().await.published.clone()
    }

    /// Published messages whose subject matches `filter`.
    pub async fn published_matching(&self, filter: &str) -> Vec<PublishedMessage> {
        self.inner
            .state
            .lock()
            .await
            .published
            .iter()
            .filter(|message| subject_matches(filter, &message.subject))
            .cloned()
            .collect()
    }

    /// Ready plus in-flight messages on a durable subscription.
    pub async fn pending(&self, durable_name: &str) -> usize {
        self.inner
            .state
            .lock()
            .await
            .queues
            .get(durable_name)
            .map(|queue| queue.ready.len() + queue.in_flight.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn subscribe(
        &self,
        subject_filter: &str,
        durable_name: &str,
    ) -> BrokerResult<Box<dyn Subscription>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }

        let mut state = self.inner.state.lock().await;

        if !state.queues.contains_key(durable_name) {
            let backlog: Vec<PublishedMessage> = state
                .published
                .iter()
                .filter(|message| subject_matches(subject_filter, &message.subject))
                .cloned()
                .collect();

            let mut ready = VecDeque::with_capacity(backlog.len());
            for message in backlog {
                state.next_id += 1;
                ready.push_back(Pending {
                    id: state.next_id,
                    subject: message.subject,
                    payload: message.payload,
                    headers: message.headers,
                    deliveries: 0,
                });
            }

            state.queues.insert(
                durable_name.to_string(),
                Queue {
                    filter: subject_filter.to_string(),
                    ready,
                    in_flight: HashMap::new(),
                },
            );
        }

        debug!(durable = %durable_name, filter = %subject_filter, "In-memory subscription opened");

        Ok(Box::new(InMemorySubscription {
            inner: Arc::clone(&self.inner),
            durable_name: durable_name.to_string(),
            active: true,
        }))
    }

    async fn publish(&self, subject: &str, payload: &[u8], headers: &Headers) -> BrokerResult<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }
        if self.inner.fail_publishes.load(Ordering::SeqCst) {
            return Err(BrokerError::Unavailable(
                "in-memory broker rejecting publishes".to_string(),
            ));
        }

        let mut state = self.inner.state.lock().await;
        let state = &mut *state;

        state.published.push(PublishedMessage {
            subject: subject.to_string(),
            payload: payload.to_vec(),
            headers: headers.clone(),
        });
        state.stats.published += 1;

        for queue in state.queues.values_mut() {
            if subject_matches(&queue.filter, subject) {
                state.next_id += 1;
                queue.ready.push_back(Pending {
                    id: state.next_id,
                    subject: subject.to_string(),
                    payload: payload.to_vec(),
                    headers: headers.clone(),
                    deliveries: 0,
                });
            }
        }

        self.inner.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> BrokerResult<()> {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }
}

struct InMemorySubscription {
    inner: Arc<Inner>,
    durable_name: String,
    active: bool,
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn fetch(
        &mut self,
        batch_size: usize,
        timeout: Duration,
    ) -> BrokerResult<Vec<BrokerMessage>> {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if !self.active || self.inner.closed.load(Ordering::SeqCst) {
                return Err(BrokerError::Closed);
            }

            {
                let mut state = self.inner.state.lock().await;
                let queue = state
                    .queues
                    .get_mut(&self.durable_name)
                    .ok_or(BrokerError::Closed)?;

                if !queue.ready.is_empty() {
                    let mut batch = Vec::new();

                    while batch.len() < batch_size.max(1) {
                        let Some(pending) = queue.ready.pop_front() else {
                            break;
                        };

                        let acker = InMemoryAcker {
                            inner: Arc::clone(&self.inner),
                            durable_name: self.durable_name.clone(),
                            id: pending.id,
                        };

                        batch.push(
                            BrokerMessage::new(
                                pending.subject.clone(),
                                pending.payload.clone(),
                                pending.headers.clone(),
                                Box::new(acker),
                            )
                            .with_delivery_count(Some(pending.deliveries))
                            .with_message_id(Some(format!("mem-{}", pending.id))),
                        );

                        queue.in_flight.insert(pending.id, pending);
                    }

                    return Ok(batch);
                }
            }

            if timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn unsubscribe(&mut self) -> BrokerResult<()> {
        self.active = false;

        let mut state = self.inner.state.lock().await;
        if let Some(queue) = state.queues.get_mut(&self.durable_name) {
            let mut returned: Vec<Pending> = queue.in_flight.drain().map(|(_, p)| p).collect();
            returned.sort_by_key(|pending| pending.id);

            for pending in returned.into_iter().rev() {
                queue.ready.push_front(pending);
            }
        }

        Ok(())
    }
}

struct InMemoryAcker {
    inner: Arc<Inner>,
    durable_name: String,
    id: u64,
}

#[async_trait]
impl Acker for InMemoryAcker {
    async fn ack(&self) -> BrokerResult<()> {
        let mut state = self.inner.state.lock().await;

        let removed = state
            .queues
            .get_mut(&self.durable_name)
            .and_then(|queue| queue.in_flight.remove(&self.id));

        if removed.is_some() {
            state.stats.acked += 1;
        }
        Ok(())
    }

    async fn nak(&self) -> BrokerResult<()> {
        let mut state = self.inner.state.lock().await;

        let requeued = match state.queues.get_mut(&self.durable_name) {
            Some(queue) => match queue.in_flight.remove(&self.id) {
                Some(mut pending) => {
                    pending.deliveries += 1;
                    queue.ready.push_back(pending);
                    true
                }
                None => false,
            },
            None => false,
        };

        if requeued {
            state.stats.naked += 1;
            self.inner.notify.notify_waiters();
        }
        Ok(())
    }
}
