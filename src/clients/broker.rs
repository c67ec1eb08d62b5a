use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    time::Duration,
};

use async_trait::async_trait;
use thiserror::Error;

use crate::models::event::{HEADER_EVENT_ID, Headers};

#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("Subscription closed")]
    Closed,

    #[error("Broker unavailable: {0}")]
    Unavailable(String),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Settles one delivery with the broker.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> BrokerResult<()>;

    /// Negative-acknowledge: the broker redelivers the message later.
    async fn nak(&self) -> BrokerResult<()>;
}

/// A message pulled from a subscription, not yet acknowledged.
pub struct BrokerMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
    /// Previous deliveries of this message, when the broker tracks them.
    pub delivery_count: Option<u32>,
    pub message_id: Option<String>,
    acker: Box<dyn Acker>,
}

impl BrokerMessage {
    pub fn new(
        subject: impl Into<String>,
        payload: Vec<u8>,
        headers: Headers,
        acker: Box<dyn Acker>,
    ) -> Self {
        Self {
            subject: subject.into(),
            payload,
            headers,
            delivery_count: None,
            message_id: None,
            acker,
        }
    }

    pub fn with_delivery_count(mut self, delivery_count: Option<u32>) -> Self {
        self.delivery_count = delivery_count;
        self
    }

    pub fn with_message_id(mut self, message_id: Option<String>) -> Self {
        self.message_id = message_id;
        self
    }

    pub async fn ack(&self) -> BrokerResult<()> {
        self.acker.ack().await
    }

    pub async fn nak(&self) -> BrokerResult<()> {
        self.acker.nak().await
    }

    /// Stable identity across redeliveries, used for local attempt counting.
    pub fn tracking_id(&self) -> String {
        if let Some(id) = &self.message_id {
            return id.clone();
        }
        if let Some(id) = self.headers.get(HEADER_EVENT_ID) {
            return id.clone();
        }

        let mut hasher = DefaultHasher::new();
        self.subject.hash(&mut hasher);
        self.payload.hash(&mut hasher);
        format!("{:016x}", hasher.finish())
    }
}

impl std::fmt::Debug for BrokerMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerMessage")
            .field("subject", &self.subject)
            .field("payload_len", &self.payload.len())
            .field("headers", &self.headers)
            .field("delivery_count", &self.delivery_count)
            .field("message_id", &self.message_id)
            .finish()
    }
}

#[async_trait]
pub trait Subscription: Send {
    /// Waits up to `timeout` for the first message, then drains whatever else
    /// is immediately available up to `batch_size`. Returns an empty batch on
    /// timeout.
    async fn fetch(
        &mut self,
        batch_size: usize,
        timeout: Duration,
    ) -> BrokerResult<Vec<BrokerMessage>>;

    /// Stops delivery. Unacknowledged messages go back to the broker.
    async fn unsubscribe(&mut self) -> BrokerResult<()>;
}

#[async_trait]
pub trait Broker: Send + Sync {
    /// Opens a durable pull subscription. Replicas sharing `durable_name`
    /// share the work.
    async fn subscribe(
        &self,
        subject_filter: &str,
        durable_name: &str,
    ) -> BrokerResult<Box<dyn Subscription>>;

    async fn publish(&self, subject: &str, payload: &[u8], headers: &Headers) -> BrokerResult<()>;

    async fn close(&self) -> BrokerResult<()>;

    fn is_connected(&self) -> bool;
}

/// Dot-separated subject matching: `*` matches one token, `>` and `#` match
/// the remaining tokens (`>` needs at least one, `#` accepts zero).
pub fn subject_matches(filter: &str, subject: &str) -> bool {
    let filter_tokens: Vec<&str> = filter.split('.').collect();
    let subject_tokens: Vec<&str> = subject.split('.').collect();

    for (i, token) in filter_tokens.iter().enumerate() {
        match *token {
            ">" => return subject_tokens.len() > i,
            "#" => return true,
            "*" => {
                if i >= subject_tokens.len() {
                    return false;
                }
            }
            literal => {
                if subject_tokens.get(i) != Some(&literal) {
                    return false;
                }
            }
        }
    }

    filter_tokens.len() == subject_tokens.len()
}
