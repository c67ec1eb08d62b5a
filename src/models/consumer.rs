use std::time::Duration;

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::{
    clients::{broker::BrokerError, store::StoreError},
    models::event::{
        EventEnvelope, HEADER_EVENT_ID, HEADER_EVENT_TYPE, HEADER_IDEMPOTENCY_KEY, Headers,
    },
};

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Durable subscription name shared by the replicas of one consumer.
    pub name: String,
    pub subject_filter: String,
    pub max_retries: u32,
    pub retry_delay_seconds: u64,
    pub max_retry_delay_seconds: u64,
    pub exponential_backoff: bool,
    pub dlq_enabled: bool,
    pub dlq_subject_prefix: String,
    pub batch_size: usize,
    pub fetch_timeout_ms: u64,
}

impl ConsumerConfig {
    pub fn new(name: impl Into<String>, subject_filter: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            subject_filter: subject_filter.into(),
            ..Self::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_delay_seconds(mut self, seconds: u64) -> Self {
        self.retry_delay_seconds = seconds;
        self
    }

    pub fn with_exponential_backoff(mut self, enabled: bool) -> Self {
        self.exponential_backoff = enabled;
        self
    }

    pub fn with_dlq(mut self, enabled: bool) -> Self {
        self.dlq_enabled = enabled;
        self
    }

    pub fn with_dlq_subject_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.dlq_subject_prefix = prefix.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// `base * 2^attempt` in exponential mode, constant `base` otherwise.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.retry_delay_seconds;
        let seconds = if self.exponential_backoff {
            base.saturating_mul(2u64.saturating_pow(attempt))
        } else {
            base
        };

        Duration::from_secs(seconds.min(self.max_retry_delay_seconds.max(base)))
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            name: "events_worker".to_string(),
            subject_filter: "events.>".to_string(),
            max_retries: 3,
            retry_delay_seconds: 5,
            max_retry_delay_seconds: 300,
            exponential_backoff: true,
            dlq_enabled: true,
            dlq_subject_prefix: "dlq".to_string(),
            batch_size: 10,
            fetch_timeout_ms: 5_000,
        }
    }
}

/// One delivery attempt as seen by a handler.
#[derive(Debug, Clone)]
pub struct ConsumerContext {
    pub subject: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub attempt: u32,
    pub max_retries: u32,
}

impl ConsumerContext {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_retries
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn envelope(&self) -> Result<EventEnvelope, HandlerError> {
        self.json()
    }

    pub fn event_id(&self) -> Option<String> {
        self.header(HEADER_EVENT_ID)
            .map(str::to_string)
            .or_else(|| self.payload_field("event_id"))
    }

    pub fn event_type(&self) -> Option<String> {
        self.header(HEADER_EVENT_TYPE)
            .map(str::to_string)
            .or_else(|| self.payload_field("event_type"))
    }

    pub fn idempotency_key(&self) -> Option<String> {
        self.header(HEADER_IDEMPOTENCY_KEY)
            .map(str::to_string)
            .or_else(|| self.payload_field("idempotency_key"))
    }

    fn payload_field(&self, field: &str) -> Option<String> {
        serde_json::from_slice::<serde_json::Value>(&self.payload)
            .ok()?
            .get(field)?
            .as_str()
            .map(str::to_string)
    }
}

/// Outcome a handler reports for one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingResult {
    Success,
    /// Transient failure; redeliver after backoff while budget remains.
    Retry(String),
    /// Permanent failure; quarantine immediately.
    DeadLetter { error_type: String, message: String },
}

impl ProcessingResult {
    pub fn retry(reason: impl Into<String>) -> Self {
        ProcessingResult::Retry(reason.into())
    }

    pub fn dead_letter(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        ProcessingResult::DeadLetter {
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProcessingResult::Success)
    }
}

/// Error raised by handler code. Always treated as retryable by the consumer.
#[derive(Debug, Clone, Error)]
#[error("{error_type}: {message}")]
pub struct HandlerError {
    pub error_type: String,
    pub message: String,
    pub stack_trace: Option<String>,
}

impl HandlerError {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            stack_trace: None,
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        let causes: Vec<String> = err.chain().skip(1).map(|cause| cause.to_string()).collect();

        Self {
            error_type: classify_error(&err).to_string(),
            message: err.to_string(),
            stack_trace: (!causes.is_empty()).then(|| causes.join("\ncaused by: ")),
        }
    }
}

impl From<serde_json::Error> for HandlerError {
    fn from(err: serde_json::Error) -> Self {
        Self::new("JsonError", err.to_string())
    }
}

impl From<StoreError> for HandlerError {
    fn from(err: StoreError) -> Self {
        Self::new("StoreError", err.to_string())
    }
}

impl From<BrokerError> for HandlerError {
    fn from(err: BrokerError) -> Self {
        Self::new("BrokerError", err.to_string())
    }
}

fn classify_error(err: &anyhow::Error) -> &'static str {
    for cause in err.chain() {
        if cause.is::<serde_json::Error>() {
            return "JsonError";
        }
        if cause.is::<tokio_postgres::Error>() {
            return "DatabaseError";
        }
        if cause.is::<redis::RedisError>() || cause.is::<StoreError>() {
            return "StoreError";
        }
        if cause.is::<lapin::Error>() || cause.is::<BrokerError>() {
            return "BrokerError";
        }
        if cause.is::<std::io::Error>() {
            return "IoError";
        }
    }

    "HandlerError"
}

#[cfg(test)]
mod tests {
    use anyhow::{Context, anyhow};

    use super::*;

    fn context(payload: &[u8]) -> ConsumerContext {
        ConsumerContext {
            subject: "events.order.created".to_string(),
            payload: payload.to_vec(),
            headers: Headers::new(),
            attempt: 0,
            max_retries: 3,
        }
    }

    #[test]
    fn test_exponential_backoff_delays() {
        let config = ConsumerConfig::default().with_retry_delay_seconds(2);

        assert_eq!(config.backoff_delay(0), Duration::from_secs(2));
        assert_eq!(config.backoff_delay(1), Duration::from_secs(4));
        assert_eq!(config.backoff_delay(3), Duration::from_secs(16));
        assert_eq!(config.backoff_delay(40), Duration::from_secs(300));
    }

    #[test]
    fn test_constant_backoff_delays() {
        let config = ConsumerConfig::default()
            .with_retry_delay_seconds(3)
            .with_exponential_backoff(false);

        assert_eq!(config.backoff_delay(0), Duration::from_secs(3));
        assert_eq!(config.backoff_delay(5), Duration::from_secs(3));
    }

    #[test]
    fn test_parse_failure_classified_as_json_error() {
        let err = context(b"not json").envelope().unwrap_err();
        assert_eq!(err.error_type, "JsonError");
    }

    #[test]
    fn test_anyhow_error_classification() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: HandlerError = anyhow::Error::new(json_err)
            .context("decoding weather payload")
            .into();
        assert_eq!(err.error_type, "JsonError");
        assert_eq!(err.message, "decoding weather payload");
        assert!(err.stack_trace.is_some());

        let other: HandlerError = anyhow!("sensor offline").into();
        assert_eq!(other.error_type, "HandlerError");
        assert!(other.stack_trace.is_none());
    }

    #[test]
    fn test_context_identity_from_payload() {
        let ctx = context(br#"{"event_id":"evt-3","event_type":"order.created"}"#);

        assert_eq!(ctx.event_id().as_deref(), Some("evt-3"));
        assert_eq!(ctx.event_type().as_deref(), Some("order.created"));
        assert_eq!(ctx.idempotency_key(), None);
    }

    #[test]
    fn test_io_error_context_keeps_type() {
        let result: anyhow::Result<()> =
            Err::<(), _>(std::io::Error::other("disk full")).context("writing report");
        let err: HandlerError = result.unwrap_err().into();
        assert_eq!(err.error_type, "IoError");
    }
}
