use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    time::Duration,
};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use uuid::Uuid;

use crate::models::{
    consumer::ConsumerContext,
    event::{
        HEADER_ERROR_TYPE, HEADER_EVENT_ID, HEADER_EVENT_TYPE, HEADER_REPLAY_COUNT,
        HEADER_SOURCE_SERVICE, Headers,
    },
};

/// Key used to wrap payloads that are not valid JSON.
pub const RAW_PAYLOAD_KEY: &str = "_raw_payload";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqReason {
    MaxRetriesExceeded,
    ExplicitDeadLetter,
}

impl Display for DlqReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            DlqReason::MaxRetriesExceeded => write!(f, "max_retries_exceeded"),
            DlqReason::ExplicitDeadLetter => write!(f, "explicit_dead_letter"),
        }
    }
}

/// Immutable snapshot of a message that could not be processed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedEvent {
    pub event_id: String,
    pub original_subject: String,
    pub event_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_service: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    pub error_message: String,
    pub error_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,

    pub retry_count: u32,
    pub max_retries: u32,
    pub first_attempt_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
    pub original_data: JsonValue,

    /// Producer bytes, base64 encoded. Replays republish these verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_payload: Option<String>,

    #[serde(default)]
    pub original_headers: Headers,

    pub dlq_timestamp: DateTime<Utc>,
    pub dlq_reason: DlqReason,
}

/// Failure details attached to a dead-lettered delivery.
#[derive(Debug, Clone)]
pub struct FailureDetails {
    pub error_type: String,
    pub error_message: String,
    pub stack_trace: Option<String>,
    pub reason: DlqReason,
    pub first_attempt_at: DateTime<Utc>,
}

impl FailedEvent {
    pub fn from_context(ctx: &ConsumerContext, failure: FailureDetails) -> Self {
        let original_data = parse_payload(&ctx.payload);
        let now = Utc::now();

        let field = |name: &str| {
            original_data
                .get(name)
                .and_then(JsonValue::as_str)
                .map(str::to_string)
        };

        Self {
            event_id: ctx.event_id().unwrap_or_else(|| Uuid::new_v4().to_string()),
            original_subject: ctx.subject.clone(),
            event_type: ctx.event_type().unwrap_or_else(|| ctx.subject.clone()),
            source_service: ctx
                .header(HEADER_SOURCE_SERVICE)
                .map(str::to_string)
                .or_else(|| field("source_service")),
            tenant_id: field("tenant_id"),
            correlation_id: field("correlation_id"),
            entity_id: field("entity_id"),
            error_message: failure.error_message,
            error_type: failure.error_type,
            stack_trace: failure.stack_trace,
            retry_count: ctx.attempt,
            max_retries: ctx.max_retries,
            first_attempt_at: failure.first_attempt_at,
            last_attempt_at: now,
            original_data,
            original_payload: Some(BASE64.encode(&ctx.payload)),
            original_headers: ctx.headers.clone(),
            dlq_timestamp: now,
            dlq_reason: failure.reason,
        }
    }

    /// Bytes to republish to the original subject.
    ///
    /// Events recorded without the producer bytes fall back to the raw
    /// wrapper or a re-rendering of `original_data`.
    pub fn replay_payload(&self) -> Vec<u8> {
        if let Some(bytes) = self
            .original_payload
            .as_deref()
            .and_then(|encoded| BASE64.decode(encoded).ok())
        {
            return bytes;
        }

        if let Some(raw) = self.raw_payload() {
            return raw.as_bytes().to_vec();
        }

        serde_json::to_vec(&self.original_data).unwrap_or_default()
    }

    pub fn raw_payload(&self) -> Option<&str> {
        let object = self.original_data.as_object()?;
        if object.len() != 1 {
            return None;
        }
        object.get(RAW_PAYLOAD_KEY)?.as_str()
    }

    /// Headers for a replay, with the replay counter bumped.
    pub fn replay_headers(&self) -> Headers {
        let mut headers = self.original_headers.clone();
        headers.insert(
            HEADER_REPLAY_COUNT.to_string(),
            (self.replay_count() + 1).to_string(),
        );
        headers
    }

    /// Headers carried by the dead-letter message itself.
    pub fn dlq_headers(&self) -> Headers {
        let mut headers = Headers::new();
        headers.insert(HEADER_EVENT_ID.to_string(), self.event_id.clone());
        headers.insert(HEADER_EVENT_TYPE.to_string(), self.event_type.clone());
        headers.insert(HEADER_ERROR_TYPE.to_string(), self.error_type.clone());
        if let Some(source) = &self.source_service {
            headers.insert(HEADER_SOURCE_SERVICE.to_string(), source.clone());
        }
        headers
    }

    pub fn replay_count(&self) -> u32 {
        self.original_headers
            .get(HEADER_REPLAY_COUNT)
            .and_then(|count| count.parse().ok())
            .unwrap_or(0)
    }
}

/// Best-effort JSON parse, falling back to a lossy raw-string wrapper.
pub fn parse_payload(payload: &[u8]) -> JsonValue {
    serde_json::from_slice(payload).unwrap_or_else(|_| {
        let mut wrapper = Map::new();
        wrapper.insert(
            RAW_PAYLOAD_KEY.to_string(),
            JsonValue::String(String::from_utf8_lossy(payload).into_owned()),
        );
        JsonValue::Object(wrapper)
    })
}

/// Dead-letter subject for an event type, e.g. `dlq.order.created`.
pub fn dlq_subject(prefix: &str, event_type: &str) -> String {
    let sanitized: String = event_type
        .trim()
        .chars()
        .map(|c| match c {
            '*' | '>' | '#' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect();

    let sanitized = sanitized.trim_matches('.');
    if sanitized.is_empty() {
        format!("{}.unknown", prefix)
    } else {
        format!("{}.{}", prefix, sanitized)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailedEventStatus {
    Pending,
    Retried,
    Resolved,
    Discarded,
}

impl FailedEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailedEventStatus::Pending => "pending",
            FailedEventStatus::Retried => "retried",
            FailedEventStatus::Resolved => "resolved",
            FailedEventStatus::Discarded => "discarded",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "retried" => FailedEventStatus::Retried,
            "resolved" => FailedEventStatus::Resolved,
            "discarded" => FailedEventStatus::Discarded,
            _ => FailedEventStatus::Pending,
        }
    }
}

impl Display for FailedEventStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        write!(f, "{}", self.as_str())
    }
}

/// A failed event persisted for operator review.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredFailedEvent {
    pub event: FailedEvent,
    pub status: FailedEventStatus,
    pub resolution_notes: Option<String>,
    pub stored_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What the DLQ monitor does with one failed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DlqAction {
    Store,
    Retry,
    Alert,
    Discard,
}

#[derive(Debug, Clone)]
pub struct DlqMonitorConfig {
    pub name: String,
    pub subject_filter: String,
    pub batch_size: usize,
    pub fetch_timeout_ms: u64,
}

impl DlqMonitorConfig {
    /// Watches every dead-letter subject under `prefix`.
    pub fn for_prefix(prefix: &str) -> Self {
        Self {
            subject_filter: format!("{}.>", prefix),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

impl Default for DlqMonitorConfig {
    fn default() -> Self {
        Self {
            name: "dlq_monitor".to_string(),
            subject_filter: "dlq.>".to_string(),
            batch_size: 10,
            fetch_timeout_ms: 5_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(payload: &[u8]) -> ConsumerContext {
        let mut headers = Headers::new();
        headers.insert("event-id".to_string(), "evt-77".to_string());

        ConsumerContext {
            subject: "events.irrigation.scheduled".to_string(),
            payload: payload.to_vec(),
            headers,
            attempt: 2,
            max_retries: 2,
        }
    }

    fn details() -> FailureDetails {
        FailureDetails {
            error_type: "JsonError".to_string(),
            error_message: "expected value at line 1".to_string(),
            stack_trace: None,
            reason: DlqReason::MaxRetriesExceeded,
            first_attempt_at: Utc::now(),
        }
    }

    #[test]
    fn test_failed_event_round_trip() {
        let ctx = context(br#"{"event_type":"irrigation.scheduled","tenant_id":"farm-1"}"#);
        let event = FailedEvent::from_context(&ctx, details());

        let json = serde_json::to_string(&event).unwrap();
        let parsed: FailedEvent = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed, event);
        assert_eq!(parsed.dlq_timestamp, event.dlq_timestamp);
        assert_eq!(parsed.first_attempt_at, event.first_attempt_at);
    }

    #[test]
    fn test_from_context_extracts_identity() {
        let ctx = context(
            br#"{"event_type":"irrigation.scheduled","tenant_id":"farm-1","source_service":"scheduler"}"#,
        );
        let event = FailedEvent::from_context(&ctx, details());

        assert_eq!(event.event_id, "evt-77");
        assert_eq!(event.event_type, "irrigation.scheduled");
        assert_eq!(event.tenant_id.as_deref(), Some("farm-1"));
        assert_eq!(event.source_service.as_deref(), Some("scheduler"));
        assert_eq!(event.retry_count, 2);
        assert_eq!(event.dlq_reason, DlqReason::MaxRetriesExceeded);
    }

    #[test]
    fn test_unparseable_payload_is_wrapped_raw() {
        let ctx = context(b"temperature=31;humidity=");
        let event = FailedEvent::from_context(&ctx, details());

        assert_eq!(event.raw_payload(), Some("temperature=31;humidity="));
        assert_eq!(event.replay_payload(), b"temperature=31;humidity=".to_vec());
        assert_eq!(event.event_type, "events.irrigation.scheduled");
    }

    #[test]
    fn test_replay_payload_keeps_producer_bytes() {
        let original = br#"{"z":1,"amount":1.50,"a":"x"}"#;
        let event = FailedEvent::from_context(&context(original), details());
        assert_eq!(event.original_data["amount"], serde_json::json!(1.5));

        let stored: FailedEvent =
            serde_json::from_slice(&serde_json::to_vec(&event).unwrap()).unwrap();
        assert_eq!(stored.replay_payload(), original.to_vec());

        let invalid_utf8 = [0xff, 0xfe, b'{'];
        let event = FailedEvent::from_context(&context(&invalid_utf8), details());
        assert_eq!(event.replay_payload(), invalid_utf8.to_vec());
    }

    #[test]
    fn test_replay_without_producer_bytes_renders_parsed_data() {
        let mut event = FailedEvent::from_context(&context(br#"{"a": 1}"#), details());
        event.original_payload = None;

        assert_eq!(event.replay_payload(), br#"{"a":1}"#.to_vec());
    }

    #[test]
    fn test_replay_headers_increment_count() {
        let mut event = FailedEvent::from_context(&context(b"{}"), details());
        assert_eq!(event.replay_count(), 0);

        event.original_headers = event.replay_headers();
        assert_eq!(event.replay_count(), 1);
        assert_eq!(event.replay_headers().get(HEADER_REPLAY_COUNT).unwrap(), "2");
    }

    #[test]
    fn test_dlq_subject_derivation() {
        assert_eq!(dlq_subject("dlq", "order.created"), "dlq.order.created");
        assert_eq!(dlq_subject("dlq", "bad type>"), "dlq.bad_type_");
        assert_eq!(dlq_subject("dlq", ""), "dlq.unknown");
    }

    #[test]
    fn test_status_string_conversion() {
        for status in [
            FailedEventStatus::Pending,
            FailedEventStatus::Retried,
            FailedEventStatus::Resolved,
            FailedEventStatus::Discarded,
        ] {
            assert_eq!(FailedEventStatus::from_string(status.as_str()), status);
        }
    }
}
