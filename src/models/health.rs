use std::{collections::BTreeMap, fmt::Display, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheckResponse {
    pub service: String,
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub dependencies: BTreeMap<String, DependencyHealth>,
}

/// Result of probing one backing service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyHealth {
    pub up: bool,

    /// Down optional dependencies degrade the service instead of failing it.
    pub optional: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DependencyHealth {
    pub fn up(latency: Duration) -> Self {
        Self {
            up: true,
            optional: false,
            latency_ms: Some(latency.as_millis() as u64),
            error: None,
        }
    }

    pub fn down(error: impl Display) -> Self {
        Self {
            up: false,
            optional: false,
            latency_ms: None,
            error: Some(error.to_string()),
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }
}

impl HealthCheckResponse {
    pub fn new(service: impl Into<String>, dependencies: BTreeMap<String, DependencyHealth>) -> Self {
        Self {
            service: service.into(),
            status: overall_status(&dependencies),
            timestamp: Utc::now(),
            dependencies,
        }
    }
}

/// Unhealthy if a required dependency is down, degraded if an optional one is.
pub fn overall_status(dependencies: &BTreeMap<String, DependencyHealth>) -> HealthStatus {
    let mut down = dependencies.values().filter(|dependency| !dependency.up).peekable();

    if down.peek().is_none() {
        HealthStatus::Healthy
    } else if down.any(|dependency| !dependency.optional) {
        HealthStatus::Unhealthy
    } else {
        HealthStatus::Degraded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_status() {
        let mut dependencies = BTreeMap::new();
        dependencies.insert("broker".to_string(), DependencyHealth::up(Duration::ZERO));
        assert_eq!(overall_status(&dependencies), HealthStatus::Healthy);

        dependencies.insert(
            "dedup_store".to_string(),
            DependencyHealth::down("connection refused").optional(),
        );
        assert_eq!(overall_status(&dependencies), HealthStatus::Degraded);

        dependencies.insert("broker".to_string(), DependencyHealth::down("closed"));
        assert_eq!(overall_status(&dependencies), HealthStatus::Unhealthy);
    }
}
