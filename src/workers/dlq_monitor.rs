use std::{collections::HashSet, sync::Arc, time::Duration};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use tokio::{sync::watch, task::JoinHandle, time::sleep};
use tracing::{debug, error, info, warn};

use crate::{
    clients::{
        broker::{Broker, BrokerError, BrokerMessage},
        store::FailureStore,
    },
    models::dlq::{DlqAction, DlqMonitorConfig, FailedEvent, FailedEventStatus, StoredFailedEvent},
};

const MAX_FETCH_BACKOFF_SECS: u64 = 30;

/// Decides what happens to one dead-lettered event.
///
/// The monitor has no retry ceiling of its own. Policies returning
/// [`DlqAction::Retry`] should consult `retry_count` and the replay count.
#[async_trait]
pub trait DlqPolicy: Send + Sync {
    async fn decide(&self, event: &FailedEvent) -> DlqAction;
}

/// Persists every failed event for review.
pub struct StoreAll;

#[async_trait]
impl DlqPolicy for StoreAll {
    async fn decide(&self, _event: &FailedEvent) -> DlqAction {
        DlqAction::Store
    }
}

/// Alerts on selected error types and applies `fallback` to the rest.
pub struct AlertOnErrorTypes {
    error_types: HashSet<String>,
    fallback: DlqAction,
}

impl AlertOnErrorTypes {
    pub fn new<I, S>(error_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            error_types: error_types.into_iter().map(Into::into).collect(),
            fallback: DlqAction::Store,
        }
    }

    pub fn with_fallback(mut self, fallback: DlqAction) -> Self {
        self.fallback = fallback;
        self
    }
}

#[async_trait]
impl DlqPolicy for AlertOnErrorTypes {
    async fn decide(&self, event: &FailedEvent) -> DlqAction {
        if self.error_types.contains(&event.error_type) {
            DlqAction::Alert
        } else {
            self.fallback
        }
    }
}

pub struct PolicyFn<F>(F);

pub fn policy_fn<F>(f: F) -> PolicyFn<F>
where
    F: Fn(&FailedEvent) -> DlqAction + Send + Sync,
{
    PolicyFn(f)
}

#[async_trait]
impl<F> DlqPolicy for PolicyFn<F>
where
    F: Fn(&FailedEvent) -> DlqAction + Send + Sync,
{
    async fn decide(&self, event: &FailedEvent) -> DlqAction {
        (self.0)(event)
    }
}

/// Operational alert sink.
#[async_trait]
pub trait Alerter: Send + Sync {
    async fn alert(&self, event: &FailedEvent) -> Result<(), Error>;
}

/// Emits alerts as error-level log records.
pub struct LogAlerter;

#[async_trait]
impl Alerter for LogAlerter {
    async fn alert(&self, event: &FailedEvent) -> Result<(), Error> {
        error!(
            alert = true,
            event_id = %event.event_id,
            event_type = %event.event_type,
            original_subject = %event.original_subject,
            error_type = %event.error_type,
            error = %event.error_message,
            retry_count = event.retry_count,
            source_service = event.source_service.as_deref().unwrap_or("unknown"),
            tenant_id = event.tenant_id.as_deref().unwrap_or_default(),
            "Critical failure in dead-letter queue"
        );
        Ok(())
    }
}

/// Consumer of the dead-letter namespace plus the operator workflow over the
/// failure store.
pub struct DlqMonitor {
    broker: Arc<dyn Broker>,
    policy: Arc<dyn DlqPolicy>,
    store: Option<Arc<dyn FailureStore>>,
    alerter: Arc<dyn Alerter>,
    config: DlqMonitorConfig,
}

impl DlqMonitor {
    pub fn new(broker: Arc<dyn Broker>, config: DlqMonitorConfig) -> Self {
        Self {
            broker,
            policy: Arc::new(StoreAll),
            store: None,
            alerter: Arc::new(LogAlerter),
            config,
        }
    }

    pub fn with_policy<P: DlqPolicy + 'static>(mut self, policy: P) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn FailureStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_alerter<A: Alerter + 'static>(mut self, alerter: A) -> Self {
        self.alerter = Arc::new(alerter);
        self
    }

    pub fn config(&self) -> &DlqMonitorConfig {
        &self.config
    }

    pub fn spawn(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<Result<(), Error>> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), Error> {
        let mut subscription = self
            .broker
            .subscribe(&self.config.subject_filter, &self.config.name)
            .await
            .map_err(|e| {
                anyhow!(
                    "Failed to subscribe to {}: {}",
                    self.config.subject_filter,
                    e
                )
            })?;

        info!(
            monitor = %self.config.name,
            subject_filter = %self.config.subject_filter,
            store_configured = self.store.is_some(),
            "Starting DLQ monitor"
        );

        let mut consecutive_errors: u32 = 0;

        'pull: loop {
            if *shutdown.borrow() {
                info!("Received shutdown signal, stopping DLQ monitor");
                break;
            }

            let fetched = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                result = subscription.fetch(self.config.batch_size, self.config.fetch_timeout()) => result,
            };

            let messages = match fetched {
                Ok(messages) => {
                    consecutive_errors = 0;
                    messages
                }
                Err(BrokerError::Closed) => {
                    warn!("DLQ subscription closed by broker, stopping monitor");
                    break;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    let backoff_secs =
                        std::cmp::min(2u64.pow(consecutive_errors.min(5)), MAX_FETCH_BACKOFF_SECS);
                    warn!(
                        error = %e,
                        consecutive_errors,
                        backoff_secs,
                        "DLQ fetch failed, backing off"
                    );

                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = sleep(Duration::from_secs(backoff_secs)) => {}
                    }
                    continue;
                }
            };

            for message in messages {
                if *shutdown.borrow() {
                    break 'pull;
                }
                self.handle_message(message).await;
            }
        }

        if let Err(e) = subscription.unsubscribe().await {
            warn!(error = %e, "Failed to unsubscribe DLQ monitor cleanly");
        }

        info!("DLQ monitor stopped");
        Ok(())
    }

    /// Decodes, applies the policy and settles one dead-letter message.
    pub async fn handle_message(&self, message: BrokerMessage) {
        let event = match serde_json::from_slice::<FailedEvent>(&message.payload) {
            Ok(event) => event,
            Err(e) => {
                error!(
                    subject = %message.subject,
                    error = %e,
                    bytes = message.payload.len(),
                    "Undecodable dead-letter message, dropping"
                );
                if let Err(e) = message.ack().await {
                    warn!(error = %e, "Failed to ack undecodable message");
                }
                return;
            }
        };

        match self.process(&event).await {
            Ok(action) => {
                debug!(event_id = %event.event_id, action = ?action, "Dead-letter event handled");
                if let Err(e) = message.ack().await {
                    warn!(event_id = %event.event_id, error = %e, "Failed to ack dead-letter message");
                }
            }
            Err(e) => {
                error!(
                    event_id = %event.event_id,
                    error = %e,
                    "Failed to handle dead-letter event, requeueing"
                );
                if let Err(e) = message.nak().await {
                    warn!(event_id = %event.event_id, error = %e, "Failed to nak dead-letter message");
                }
            }
        }
    }

    /// Applies the policy to one event and returns the action taken.
    pub async fn process(&self, event: &FailedEvent) -> Result<DlqAction, Error> {
        let action = self.policy.decide(event).await;

        match action {
            DlqAction::Store => self.store_event(event).await?,
            DlqAction::Retry => {
                self.republish(event).await?;
                info!(
                    event_id = %event.event_id,
                    subject = %event.original_subject,
                    retry_count = event.retry_count,
                    replay_count = event.replay_count() + 1,
                    "Dead-letter event replayed to original subject"
                );
            }
            DlqAction::Alert => {
                self.alerter.alert(event).await?;
                if self.store.is_some() {
                    self.store_event(event).await?;
                }
            }
            DlqAction::Discard => {
                info!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    error_type = %event.error_type,
                    "Dead-letter event discarded"
                );
            }
        }

        Ok(action)
    }

    async fn store_event(&self, event: &FailedEvent) -> Result<(), Error> {
        let Some(store) = &self.store else {
            warn!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                error_type = %event.error_type,
                error = %event.error_message,
                "No failure store configured, dead-letter event only logged"
            );
            return Ok(());
        };

        store
            .save(event)
            .await
            .map_err(|e| anyhow!("Failed to store event {}: {}", event.event_id, e))?;

        info!(
            event_id = %event.event_id,
            event_type = %event.event_type,
            error_type = %event.error_type,
            "Dead-letter event stored for review"
        );
        Ok(())
    }

    async fn republish(&self, event: &FailedEvent) -> Result<(), Error> {
        self.broker
            .publish(
                &event.original_subject,
                &event.replay_payload(),
                &event.replay_headers(),
            )
            .await
            .map_err(|e| {
                anyhow!(
                    "Failed to republish event {} to {}: {}",
                    event.event_id,
                    event.original_subject,
                    e
                )
            })
    }

    fn failure_store(&self) -> Result<&Arc<dyn FailureStore>, Error> {
        self.store
            .as_ref()
            .ok_or_else(|| anyhow!("No failure store configured"))
    }

    pub async fn list(
        &self,
        status: Option<FailedEventStatus>,
        limit: usize,
    ) -> Result<Vec<StoredFailedEvent>, Error> {
        Ok(self.failure_store()?.list(status, limit).await?)
    }

    pub async fn pending(&self, limit: usize) -> Result<Vec<StoredFailedEvent>, Error> {
        self.list(Some(FailedEventStatus::Pending), limit).await
    }

    pub async fn get(&self, event_id: &str) -> Result<Option<StoredFailedEvent>, Error> {
        Ok(self.failure_store()?.get(event_id).await?)
    }

    pub async fn resolve(&self, event_id: &str, notes: &str) -> Result<bool, Error> {
        self.set_status(event_id, FailedEventStatus::Resolved, notes)
            .await
    }

    pub async fn discard(&self, event_id: &str, notes: &str) -> Result<bool, Error> {
        self.set_status(event_id, FailedEventStatus::Discarded, notes)
            .await
    }

    async fn set_status(
        &self,
        event_id: &str,
        status: FailedEventStatus,
        notes: &str,
    ) -> Result<bool, Error> {
        let updated = self
            .failure_store()?
            .update_status(event_id, status, Some(notes))
            .await?;

        if updated {
            info!(event_id = %event_id, status = %status, "Failed event status updated");
        } else {
            warn!(event_id = %event_id, "No stored failed event to update");
        }
        Ok(updated)
    }

    /// Republishes a stored event to its original subject and marks it retried.
    pub async fn replay(&self, event_id: &str) -> Result<bool, Error> {
        let store = self.failure_store()?;

        let Some(stored) = store.get(event_id).await? else {
            warn!(event_id = %event_id, "No stored failed event to replay");
            return Ok(false);
        };

        self.republish(&stored.event).await?;
        store
            .update_status(event_id, FailedEventStatus::Retried, Some("replayed by operator"))
            .await?;

        info!(
            event_id = %event_id,
            subject = %stored.event.original_subject,
            "Stored failed event replayed"
        );
        Ok(true)
    }
}
