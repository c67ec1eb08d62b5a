use std::sync::Arc;

use anyhow::{Error, Result};
use tracing::info;

use crate::{
    clients::{
        broker::Broker,
        health::HealthChecker,
        memory::{InMemoryFailureStore, InMemoryStore},
        memory_broker::InMemoryBroker,
        postgres::PostgresFailureStore,
        rbmq::RabbitMqBroker,
        redis::RedisStore,
        store::{DedupStore, FailureStore},
    },
    config::Config,
    idempotency::{IdempotencyChecker, IdempotencyOptions, with_idempotency},
    workers::{
        consumer::{MessageConsumer, MessageHandler},
        dlq_monitor::{AlertOnErrorTypes, DlqMonitor},
    },
};

/// Connected collaborators for one process. Built once at startup and passed
/// down explicitly.
#[derive(Clone)]
pub struct AppContext {
    pub config: Config,
    pub store: Arc<dyn DedupStore>,
    pub broker: Arc<dyn Broker>,
    pub failure_store: Option<Arc<dyn FailureStore>>,
    pub checker: IdempotencyChecker,
}

impl AppContext {
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        let store: Arc<dyn DedupStore> = Arc::new(RedisStore::connect(&config.redis_url).await?);

        let broker: Arc<dyn Broker> = Arc::new(
            RabbitMqBroker::connect(
                &config.rabbitmq_url,
                &config.event_exchange,
                config.prefetch_count,
            )
            .await?,
        );

        let failure_store: Option<Arc<dyn FailureStore>> = match &config.database_url {
            Some(url) => Some(Arc::new(PostgresFailureStore::connect(url).await?)),
            None => {
                info!("DATABASE_URL not set, dead-letter events will not be persisted");
                None
            }
        };

        Ok(Self::assemble(config, store, broker, failure_store))
    }

    /// Process-local stores and broker, for tests and single-node runs.
    pub fn in_memory(config: &Config) -> Self {
        Self::assemble(
            config,
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryBroker::new()),
            Some(Arc::new(InMemoryFailureStore::new())),
        )
    }

    fn assemble(
        config: &Config,
        store: Arc<dyn DedupStore>,
        broker: Arc<dyn Broker>,
        failure_store: Option<Arc<dyn FailureStore>>,
    ) -> Self {
        let checker = IdempotencyChecker::new(Arc::clone(&store), config.idempotency_config())
            .with_retry_config(config.retry_config());

        Self {
            config: config.clone(),
            store,
            broker,
            failure_store,
            checker,
        }
    }

    pub fn health_checker(&self) -> HealthChecker {
        let checker = HealthChecker::new(Arc::clone(&self.store), Arc::clone(&self.broker));
        match &self.failure_store {
            Some(failure_store) => checker.with_failure_store(Arc::clone(failure_store)),
            None => checker,
        }
    }

    /// Consumer over the configured subject filter, deduplicating through the checker.
    pub fn consumer<H: MessageHandler + 'static>(&self, handler: H) -> MessageConsumer {
        let handler = with_idempotency(
            self.checker.clone(),
            handler,
            IdempotencyOptions::default(),
        );

        MessageConsumer::new(Arc::clone(&self.broker), handler, self.config.consumer_config())
            .with_publish_retry(self.config.retry_config())
    }

    /// Monitor alerting on the configured error types and storing everything else.
    pub fn dlq_monitor(&self) -> DlqMonitor {
        let mut monitor = DlqMonitor::new(Arc::clone(&self.broker), self.config.dlq_monitor_config());

        let alert_types = self.config.alert_error_types();
        if !alert_types.is_empty() {
            monitor = monitor.with_policy(AlertOnErrorTypes::new(alert_types));
        }

        match &self.failure_store {
            Some(failure_store) => monitor.with_store(Arc::clone(failure_store)),
            None => monitor,
        }
    }

    pub async fn close(&self) -> Result<(), Error> {
        self.broker.close().await?;
        info!("Connections closed");
        Ok(())
    }
}
