use std::{
    fmt::{Display, Formatter, Result as FmtResult},
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

pub const DEFAULT_IDEMPOTENCY_TTL_SECONDS: u64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyStatus {
    Processing,
    Completed,
    Failed,
}

impl Display for IdempotencyStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            IdempotencyStatus::Processing => write!(f, "PROCESSING"),
            IdempotencyStatus::Completed => write!(f, "COMPLETED"),
            IdempotencyStatus::Failed => write!(f, "FAILED"),
        }
    }
}

/// Processing state stored under one idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub idempotency_key: String,
    pub event_id: String,
    pub event_type: String,
    pub status: IdempotencyStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<JsonValue>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub first_seen_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Number of times the key has been re-acquired after a failure.
    #[serde(default)]
    pub generation: u32,
}

impl IdempotencyRecord {
    pub fn processing(idempotency_key: &str, event_id: &str, event_type: &str) -> Self {
        Self {
            idempotency_key: idempotency_key.to_string(),
            event_id: event_id.to_string(),
            event_type: event_type.to_string(),
            status: IdempotencyStatus::Processing,
            result: None,
            error: None,
            first_seen_at: Utc::now(),
            completed_at: None,
            generation: 0,
        }
    }

    pub fn with_generation(mut self, generation: u32) -> Self {
        self.generation = generation;
        self
    }

    /// COMPLETED and PROCESSING records block reprocessing; FAILED ones do not.
    pub fn is_duplicate(&self) -> bool {
        matches!(
            self.status,
            IdempotencyStatus::Processing | IdempotencyStatus::Completed
        )
    }

    pub fn is_in_progress(&self) -> bool {
        self.status == IdempotencyStatus::Processing
    }

    pub fn complete(&mut self, result: Option<JsonValue>) {
        self.status = IdempotencyStatus::Completed;
        self.result = result;
        self.error = None;
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = IdempotencyStatus::Failed;
        self.error = Some(error.into());
        self.completed_at = Some(Utc::now());
    }
}

#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    pub ttl_seconds: u64,
    pub key_prefix: String,
}

impl IdempotencyConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds.max(1))
    }
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: DEFAULT_IDEMPOTENCY_TTL_SECONDS,
            key_prefix: "idempotency".to_string(),
        }
    }
}

/// Resolved identity of one logical operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyKey {
    pub key: String,
    pub event_id: String,
    pub event_type: String,
}

impl IdempotencyKey {
    pub fn new(
        key: impl Into<String>,
        event_id: impl Into<String>,
        event_type: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            event_id: event_id.into(),
            event_type: event_type.into(),
        }
    }

    /// Prefers an explicit business key over the transport event id.
    pub fn resolve(event_id: &str, explicit_key: Option<&str>, event_type: &str) -> Self {
        Self::new(
            resolve_idempotency_key(event_id, explicit_key),
            event_id,
            event_type,
        )
    }
}

pub fn resolve_idempotency_key(event_id: &str, explicit_key: Option<&str>) -> String {
    match explicit_key.map(str::trim) {
        Some(key) if !key.is_empty() => key.to_string(),
        _ if !event_id.trim().is_empty() => event_id.trim().to_string(),
        _ => uuid::Uuid::new_v4().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_record_is_not_duplicate() {
        let mut record = IdempotencyRecord::processing("key-1", "evt-1", "order.created");
        assert!(record.is_duplicate());

        record.fail("downstream timeout");
        assert!(!record.is_duplicate());
        assert_eq!(record.error.as_deref(), Some("downstream timeout"));
        assert!(record.completed_at.is_some());
    }

    #[test]
    fn test_completed_record_keeps_result() {
        let mut record = IdempotencyRecord::processing("key-1", "evt-1", "order.created");
        record.complete(Some(serde_json::json!({"invoice": 42})));

        assert!(record.is_duplicate());
        assert!(!record.is_in_progress());
        assert_eq!(record.result, Some(serde_json::json!({"invoice": 42})));
    }

    #[test]
    fn test_status_serializes_uppercase() {
        let json = serde_json::to_string(&IdempotencyStatus::Completed).unwrap();
        assert_eq!(json, "\"COMPLETED\"");
    }

    #[test]
    fn test_explicit_key_preferred() {
        assert_eq!(resolve_idempotency_key("evt-1", Some("order-7")), "order-7");
        assert_eq!(resolve_idempotency_key("evt-1", Some("  ")), "evt-1");
        assert_eq!(resolve_idempotency_key("evt-1", None), "evt-1");
        assert!(!resolve_idempotency_key("", None).is_empty());
    }
}
