use std::{collections::BTreeMap, sync::Arc, time::Instant};

use tracing::{debug, warn};

use crate::{
    clients::{
        broker::Broker,
        store::{DedupStore, FailureStore},
    },
    models::health::{DependencyHealth, HealthCheckResponse},
};

const SERVICE_NAME: &str = env!("CARGO_PKG_NAME");

/// Checks the dedup store, the broker and, when configured, the failure store.
pub struct HealthChecker {
    store: Arc<dyn DedupStore>,
    broker: Arc<dyn Broker>,
    failure_store: Option<Arc<dyn FailureStore>>,
}

impl HealthChecker {
    pub fn new(store: Arc<dyn DedupStore>, broker: Arc<dyn Broker>) -> Self {
        Self {
            store,
            broker,
            failure_store: None,
        }
    }

    pub fn with_failure_store(mut self, failure_store: Arc<dyn FailureStore>) -> Self {
        self.failure_store = Some(failure_store);
        self
    }

    pub async fn check_all(&self) -> HealthCheckResponse {
        let mut dependencies = BTreeMap::new();

        // Idempotency fails open, so a store outage only degrades deduplication.
        dependencies.insert("dedup_store".to_string(), self.check_store().await.optional());
        dependencies.insert("message_broker".to_string(), self.check_broker());

        if let Some(failure_store) = &self.failure_store {
            dependencies.insert(
                "failure_store".to_string(),
                check_failure_store(failure_store.as_ref()).await.optional(),
            );
        }

        HealthCheckResponse::new(SERVICE_NAME, dependencies)
    }

    async fn check_store(&self) -> DependencyHealth {
        let start = Instant::now();

        match self.store.ping().await {
            Ok(()) => {
                let elapsed = start.elapsed();
                debug!(latency_ms = elapsed.as_millis() as u64, "Dedup store ping ok");
                DependencyHealth::up(elapsed)
            }
            Err(e) => {
                warn!(error = %e, "Dedup store ping failed");
                DependencyHealth::down(e)
            }
        }
    }

    fn check_broker(&self) -> DependencyHealth {
        if self.broker.is_connected() {
            DependencyHealth::up(Default::default())
        } else {
            warn!("Message broker connection is down");
            DependencyHealth::down("broker connection closed")
        }
    }
}

async fn check_failure_store(failure_store: &dyn FailureStore) -> DependencyHealth {
    let start = Instant::now();

    match failure_store.ping().await {
        Ok(()) => DependencyHealth::up(start.elapsed()),
        Err(e) => {
            warn!(error = %e, "Failure store ping failed");
            DependencyHealth::down(e)
        }
    }
}
