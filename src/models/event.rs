use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value as JsonValue;
use uuid::Uuid;

pub type Headers = HashMap<String, String>;

pub const HEADER_EVENT_ID: &str = "event-id";
pub const HEADER_EVENT_TYPE: &str = "event-type";
pub const HEADER_IDEMPOTENCY_KEY: &str = "idempotency-key";
pub const HEADER_SOURCE_SERVICE: &str = "source-service";
pub const HEADER_ERROR_TYPE: &str = "error-type";
pub const HEADER_DELIVERY_COUNT: &str = "x-delivery-count";
pub const HEADER_REPLAY_COUNT: &str = "x-dlq-replay-count";

/// Wire shape shared by the services that publish events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(default = "new_event_id")]
    pub event_id: String,
    pub event_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_service: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub data: JsonValue,
}

fn new_event_id() -> String {
    Uuid::new_v4().to_string()
}

impl EventEnvelope {
    pub fn new(event_type: impl Into<String>, data: JsonValue) -> Self {
        Self {
            event_id: new_event_id(),
            event_type: event_type.into(),
            source_service: None,
            idempotency_key: None,
            tenant_id: None,
            correlation_id: None,
            entity_id: None,
            timestamp: Utc::now(),
            data,
        }
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = event_id.into();
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_source(mut self, source_service: impl Into<String>) -> Self {
        self.source_service = Some(source_service.into());
        self
    }

    pub fn with_tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.data.clone())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Transport headers mirroring the envelope identity.
    pub fn headers(&self) -> Headers {
        let mut headers = Headers::new();
        headers.insert(HEADER_EVENT_ID.to_string(), self.event_id.clone());
        headers.insert(HEADER_EVENT_TYPE.to_string(), self.event_type.clone());

        if let Some(key) = &self.idempotency_key {
            headers.insert(HEADER_IDEMPOTENCY_KEY.to_string(), key.clone());
        }
        if let Some(source) = &self.source_service {
            headers.insert(HEADER_SOURCE_SERVICE.to_string(), source.clone());
        }

        headers
    }
}
