use anyhow::{Error, Result, anyhow};
use dotenvy::dotenv;
use serde::Deserialize;

use crate::models::{
    consumer::ConsumerConfig,
    dlq::DlqMonitorConfig,
    idempotency::{DEFAULT_IDEMPOTENCY_TTL_SECONDS, IdempotencyConfig},
    retry::RetryConfig,
};

#[derive(Clone, Deserialize, Debug)]
pub struct Config {
    pub rabbitmq_url: String,
    #[serde(default = "default_event_exchange")]
    pub event_exchange: String,
    #[serde(default = "default_prefetch_count")]
    pub prefetch_count: u16,

    pub redis_url: String,
    #[serde(default = "default_idempotency_ttl_seconds")]
    pub idempotency_ttl_seconds: u64,
    #[serde(default = "default_idempotency_key_prefix")]
    pub idempotency_key_prefix: String,

    #[serde(default)]
    pub database_url: Option<String>,

    #[serde(default = "default_consumer_name")]
    pub consumer_name: String,
    #[serde(default = "default_subject_filter")]
    pub subject_filter: String,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_max_retry_delay_seconds")]
    pub max_retry_delay_seconds: u64,
    #[serde(default = "default_true")]
    pub exponential_backoff: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    #[serde(default = "default_true")]
    pub dlq_enabled: bool,
    #[serde(default = "default_dlq_subject_prefix")]
    pub dlq_subject_prefix: String,
    #[serde(default = "default_dlq_monitor_name")]
    pub dlq_monitor_name: String,
    /// Comma-separated error types that raise an alert, e.g. `DatabaseError,StoreError`.
    #[serde(default)]
    pub dlq_alert_error_types: String,

    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,
    #[serde(default = "default_initial_retry_delay_ms")]
    pub initial_retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
    #[serde(default = "default_retry_backoff_multiplier")]
    pub retry_backoff_multiplier: u64,

    #[serde(default = "default_server_port")]
    pub server_port: u16,
}

fn default_event_exchange() -> String {
    "events".to_string()
}

fn default_prefetch_count() -> u16 {
    10
}

fn default_idempotency_ttl_seconds() -> u64 {
    DEFAULT_IDEMPOTENCY_TTL_SECONDS
}

fn default_idempotency_key_prefix() -> String {
    "idempotency".to_string()
}

fn default_consumer_name() -> String {
    "events_worker".to_string()
}

fn default_subject_filter() -> String {
    "events.>".to_string()
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_seconds() -> u64 {
    5
}

fn default_max_retry_delay_seconds() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    10
}

fn default_fetch_timeout_ms() -> u64 {
    5_000
}

fn default_dlq_subject_prefix() -> String {
    "dlq".to_string()
}

fn default_dlq_monitor_name() -> String {
    "dlq_monitor".to_string()
}

fn default_max_retry_attempts() -> u32 {
    3
}

fn default_initial_retry_delay_ms() -> u64 {
    100
}

fn default_max_retry_delay_ms() -> u64 {
    2_000
}

fn default_retry_backoff_multiplier() -> u64 {
    2
}

fn default_server_port() -> u16 {
    8080
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        dotenv().ok();

        let config = envy::from_env::<Self>()
            .map_err(|e| anyhow!("Invalid or missing environment variable: {}", e))?;
        Ok(config)
    }

    /// Builds a config from explicit `(NAME, value)` pairs instead of the process environment.
    pub fn from_vars<I>(vars: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        envy::from_iter::<_, Self>(vars)
            .map_err(|e| anyhow!("Invalid or missing environment variable: {}", e))
    }

    pub fn consumer_config(&self) -> ConsumerConfig {
        ConsumerConfig {
            name: self.consumer_name.clone(),
            subject_filter: self.subject_filter.clone(),
            max_retries: self.max_retries,
            retry_delay_seconds: self.retry_delay_seconds,
            max_retry_delay_seconds: self.max_retry_delay_seconds,
            exponential_backoff: self.exponential_backoff,
            dlq_enabled: self.dlq_enabled,
            dlq_subject_prefix: self.dlq_subject_prefix.clone(),
            batch_size: self.batch_size,
            fetch_timeout_ms: self.fetch_timeout_ms,
        }
    }

    pub fn idempotency_config(&self) -> IdempotencyConfig {
        IdempotencyConfig {
            ttl_seconds: self.idempotency_ttl_seconds,
            key_prefix: self.idempotency_key_prefix.clone(),
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_retry_attempts,
            initial_delay_ms: self.initial_retry_delay_ms,
            max_delay_ms: self.max_retry_delay_ms,
            backoff_multiplier: self.retry_backoff_multiplier,
        }
    }

    pub fn dlq_monitor_config(&self) -> DlqMonitorConfig {
        DlqMonitorConfig {
            batch_size: self.batch_size,
            fetch_timeout_ms: self.fetch_timeout_ms,
            ..DlqMonitorConfig::for_prefix(&self.dlq_subject_prefix)
        }
        .with_name(self.dlq_monitor_name.clone())
    }

    pub fn alert_error_types(&self) -> Vec<String> {
        self.dlq_alert_error_types
            .split(',')
            .map(str::trim)
            .filter(|error_type| !error_type.is_empty())
            .map(str::to_string)
            .collect()
    }
}
