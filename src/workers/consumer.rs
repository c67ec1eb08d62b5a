use std::{collections::HashMap, future::Future, marker::PhantomData, sync::Arc, time::Duration};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::{
    sync::watch,
    task::{JoinHandle, JoinSet},
    time::sleep,
};
use tracing::{debug, error, info, warn};

use crate::{
    clients::broker::{Broker, BrokerError, BrokerMessage},
    models::{
        consumer::{ConsumerConfig, ConsumerContext, HandlerError, ProcessingResult},
        dlq::{DlqReason, FailedEvent, FailureDetails, dlq_subject},
        retry::RetryConfig,
    },
    utils::retry_with_backoff,
};

const MAX_FETCH_BACKOFF_SECS: u64 = 30;
const MAX_TRACKED_MESSAGES: usize = 10_000;
const RETRY_EXHAUSTED_ERROR: &str = "RetryExhausted";

/// Processes one delivery and reports how it should be settled.
///
/// Errors are retried like [`ProcessingResult::Retry`]. Handlers that know a
/// failure is permanent should return [`ProcessingResult::DeadLetter`].
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, ctx: &ConsumerContext) -> Result<ProcessingResult, HandlerError>;
}

#[async_trait]
impl<H: MessageHandler + ?Sized> MessageHandler for Arc<H> {
    async fn handle(&self, ctx: &ConsumerContext) -> Result<ProcessingResult, HandlerError> {
        (**self).handle(ctx).await
    }
}

/// Adapts an async closure into a [`MessageHandler`].
pub struct HandlerFn<F, Fut> {
    f: F,
    _future: PhantomData<fn() -> Fut>,
}

pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F, Fut>
where
    F: Fn(ConsumerContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ProcessingResult, HandlerError>> + Send,
{
    HandlerFn {
        f,
        _future: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for HandlerFn<F, Fut>
where
    F: Fn(ConsumerContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ProcessingResult, HandlerError>> + Send,
{
    async fn handle(&self, ctx: &ConsumerContext) -> Result<ProcessingResult, HandlerError> {
        (self.f)(ctx.clone()).await
    }
}

struct AttemptState {
    naks: u32,
    first_attempt_at: DateTime<Utc>,
    /// Set when the handler gave up but the dead-letter publish failed.
    dead_letter: Option<(u32, FailureDetails)>,
}

/// Pull loop over one durable subscription.
///
/// Each delivery ends in exactly one of: ack after success, nak plus backoff
/// while retry budget remains, or publication of a [`FailedEvent`] to the
/// dead-letter subject followed by an ack.
pub struct MessageConsumer {
    broker: Arc<dyn Broker>,
    handler: Arc<dyn MessageHandler>,
    config: ConsumerConfig,
    publish_retry: RetryConfig,
    attempts: HashMap<String, AttemptState>,
    max_tracked: usize,
}

impl MessageConsumer {
    pub fn new<H>(broker: Arc<dyn Broker>, handler: H, config: ConsumerConfig) -> Self
    where
        H: MessageHandler + 'static,
    {
        Self::with_arc_handler(broker, Arc::new(handler), config)
    }

    pub fn with_arc_handler(
        broker: Arc<dyn Broker>,
        handler: Arc<dyn MessageHandler>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            broker,
            handler,
            config,
            publish_retry: RetryConfig::default(),
            attempts: HashMap::new(),
            max_tracked: MAX_TRACKED_MESSAGES,
        }
    }

    /// Backoff for publishing failed events to the dead-letter subject.
    pub fn with_publish_retry(mut self, publish_retry: RetryConfig) -> Self {
        self.publish_retry = publish_retry;
        self
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<Result<(), Error>> {
        tokio::spawn(self.run(shutdown))
    }

    /// Runs until `shutdown` flips to true or its sender is dropped.
    ///
    /// Messages fetched but not yet settled when shutdown arrives are left for
    /// redelivery.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), Error> {
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
            consumer = %self.config.name,
            subject_filter = %self.config.subject_filter,
            max_retries = self.config.max_retries,
            dlq_enabled = self.config.dlq_enabled,
            "Starting message consumer"
        );

        let mut consecutive_errors: u32 = 0;

        'pull: loop {
            if *shutdown.borrow() {
                info!(consumer = %self.config.name, "Received shutdown signal, stopping consumer");
                break;
            }

            let fetched = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        info!(consumer = %self.config.name, "Shutdown sender dropped, stopping consumer");
                        break;
                    }
                    continue;
                }
                result = subscription.fetch(self.config.batch_size, self.config.fetch_timeout()) => result,
            };

            let messages = match fetched {
                Ok(messages) => {
                    if consecutive_errors > 0 {
                        info!(
                            consumer = %self.config.name,
                            "Broker connection recovered after {} errors", consecutive_errors
                        );
                        consecutive_errors = 0;
                    }
                    messages
                }
                Err(BrokerError::Closed) => {
                    warn!(consumer = %self.config.name, "Subscription closed by broker, stopping consumer");
                    break;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    let backoff_secs =
                        std::cmp::min(2u64.pow(consecutive_errors.min(5)), MAX_FETCH_BACKOFF_SECS);

                    warn!(
                        consumer = %self.config.name,
                        error = %e,
                        consecutive_errors,
                        backoff_secs,
                        "Fetch failed, backing off"
                    );

                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = sleep(Duration::from_secs(backoff_secs)) => {}
                    }
                    continue;
                }
            };

            if messages.is_empty() {
                debug!(consumer = %self.config.name, "Fetch timed out with no messages");
                continue;
            }

            for message in messages {
                if *shutdown.borrow() {
                    info!(
                        consumer = %self.config.name,
                        "Shutdown requested mid-batch, leaving remaining messages for redelivery"
                    );
                    break 'pull;
                }

                self.process_message(message, &mut shutdown).await;
            }
        }

        if let Err(e) = subscription.unsubscribe().await {
            warn!(consumer = %self.config.name, error = %e, "Failed to unsubscribe cleanly");
        }

        info!(consumer = %self.config.name, "Message consumer stopped");
        Ok(())
    }

    async fn process_message(
        &mut self,
        message: BrokerMessage,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let tracking_id = message.tracking_id();
        let (attempt, first_attempt_at) = self.attempt_for(&message, &tracking_id);

        let ctx = ConsumerContext {
            subject: message.subject.clone(),
            payload: message.payload.clone(),
            headers: message.headers.clone(),
            attempt,
            max_retries: self.config.max_retries,
        };

        if let Some((dlq_attempt, details)) =
            self.pending_dead_letter(&tracking_id, attempt, first_attempt_at)
        {
            info!(
                subject = %ctx.subject,
                attempt,
                error_type = %details.error_type,
                "Retry budget already spent, dead-lettering without running the handler"
            );
            let ctx = ConsumerContext {
                attempt: dlq_attempt,
                ..ctx
            };
            self.dead_letter(message, &ctx, &tracking_id, details, shutdown)
                .await;
            return;
        }

        debug!(
            subject = %ctx.subject,
            attempt,
            max_retries = ctx.max_retries,
            "Processing message"
        );

        let outcome = self.handler.handle(&ctx).await;
        let failure = match outcome {
            Ok(ProcessingResult::Success) => {
                if let Err(e) = message.ack().await {
                    warn!(subject = %ctx.subject, error = %e, "Failed to ack processed message");
                }
                self.attempts.remove(&tracking_id);
                debug!(subject = %ctx.subject, attempt, "Message processed");
                return;
            }
            Ok(ProcessingResult::DeadLetter {
                error_type,
                message: error_message,
            }) => {
                let details = FailureDetails {
                    error_type,
                    error_message,
                    stack_trace: None,
                    reason: DlqReason::ExplicitDeadLetter,
                    first_attempt_at,
                };
                self.dead_letter(message, &ctx, &tracking_id, details, shutdown)
                    .await;
                return;
            }
            Ok(ProcessingResult::Retry(reason)) => {
                HandlerError::new(RETRY_EXHAUSTED_ERROR, reason)
            }
            Err(e) => {
                warn!(
                    subject = %ctx.subject,
                    attempt,
                    error_type = %e.error_type,
                    error = %e.message,
                    "Handler returned an error"
                );
                e
            }
        };

        if attempt < self.config.max_retries {
            self.retry(message, &ctx, &tracking_id, &failure, shutdown)
                .await;
            return;
        }

        let details = FailureDetails {
            error_type: failure.error_type,
            error_message: failure.message,
            stack_trace: failure.stack_trace,
            reason: DlqReason::MaxRetriesExceeded,
            first_attempt_at,
        };
        self.dead_letter(message, &ctx, &tracking_id, details, shutdown)
            .await;
    }

    /// Attempt number of this delivery, counting from zero.
    fn attempt_for(&mut self, message: &BrokerMessage, tracking_id: &str) -> (u32, DateTime<Utc>) {
        if self.attempts.len() >= self.max_tracked && !self.attempts.contains_key(tracking_id) {
            self.evict_oldest_attempts();
        }

        let state = self
            .attempts
            .entry(tracking_id.to_string())
            .or_insert_with(|| AttemptState {
                naks: 0,
                first_attempt_at: Utc::now(),
                dead_letter: None,
            });

        (
            message.delivery_count.unwrap_or(state.naks),
            state.first_attempt_at,
        )
    }

    /// Drops the oldest tenth of tracked messages so eviction stays rare.
    fn evict_oldest_attempts(&mut self) {
        let excess = (self.attempts.len() + 1).saturating_sub(self.max_tracked);
        let count = excess.max(self.max_tracked / 10).min(self.attempts.len());

        let mut by_age: Vec<(DateTime<Utc>, String)> = self
            .attempts
            .iter()
            .map(|(id, state)| (state.first_attempt_at, id.clone()))
            .collect();
        by_age.sort_unstable();

        for (_, id) in by_age.into_iter().take(count) {
            self.attempts.remove(&id);
        }

        debug!(
            consumer = %self.config.name,
            evicted = count,
            tracked = self.attempts.len(),
            "Evicted oldest attempt counters"
        );
    }

    /// Failure to dead-letter with when the handler must not run again.
    ///
    /// Either an earlier dead-letter publish failed, or the broker reports
    /// more deliveries than the retry budget allows.
    fn pending_dead_letter(
        &self,
        tracking_id: &str,
        attempt: u32,
        first_attempt_at: DateTime<Utc>,
    ) -> Option<(u32, FailureDetails)> {
        if let Some(pending) = self
            .attempts
            .get(tracking_id)
            .and_then(|state| state.dead_letter.clone())
        {
            return Some(pending);
        }

        if attempt <= self.config.max_retries {
            return None;
        }

        Some((
            self.config.max_retries,
            FailureDetails {
                error_type: RETRY_EXHAUSTED_ERROR.to_string(),
                error_message: format!(
                    "delivered {} times with a retry budget of {}",
                    attempt + 1,
                    self.config.max_retries
                ),
                stack_trace: None,
                reason: DlqReason::MaxRetriesExceeded,
                first_attempt_at,
            },
        ))
    }

    async fn retry(
        &mut self,
        message: BrokerMessage,
        ctx: &ConsumerContext,
        tracking_id: &str,
        failure: &HandlerError,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let delay = self.config.backoff_delay(ctx.attempt);

        if let Some(state) = self.attempts.get_mut(tracking_id) {
            state.naks += 1;
        }

        if let Err(e) = message.nak().await {
            warn!(subject = %ctx.subject, error = %e, "Failed to nak message");
        }

        info!(
            subject = %ctx.subject,
            attempt = ctx.attempt,
            max_retries = ctx.max_retries,
            delay_ms = delay.as_millis() as u64,
            reason = %failure.message,
            "Retrying message after backoff"
        );

        tokio::select! {
            _ = shutdown.changed() => {}
            _ = sleep(delay) => {}
        }
    }

    async fn dead_letter(
        &mut self,
        message: BrokerMessage,
        ctx: &ConsumerContext,
        tracking_id: &str,
        details: FailureDetails,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let event = FailedEvent::from_context(ctx, details.clone());

        if !self.config.dlq_enabled {
            error!(
                event_id = %event.event_id,
                subject = %event.original_subject,
                error_type = %event.error_type,
                error = %event.error_message,
                retry_count = event.retry_count,
                "Dead-lettering disabled, dropping failed message"
            );
            if let Err(e) = message.ack().await {
                warn!(subject = %ctx.subject, error = %e, "Failed to ack dropped message");
            }
            self.attempts.remove(tracking_id);
            return;
        }

        let subject = dlq_subject(&self.config.dlq_subject_prefix, &event.event_type);
        let headers = event.dlq_headers();

        let published = match serde_json::to_vec(&event) {
            Ok(payload) => retry_with_backoff(&self.publish_retry, || {
                self.broker.publish(&subject, &payload, &headers)
            })
            .await
            .map_err(Error::from),
            Err(e) => Err(Error::from(e)),
        };

        match published {
            Ok(()) => {
                warn!(
                    event_id = %event.event_id,
                    subject = %event.original_subject,
                    dlq_subject = %subject,
                    error_type = %event.error_type,
                    retry_count = event.retry_count,
                    reason = %event.dlq_reason,
                    "Message moved to dead-letter queue"
                );
                if let Err(e) = message.ack().await {
                    warn!(subject = %ctx.subject, error = %e, "Failed to ack dead-lettered message");
                }
                self.attempts.remove(tracking_id);
            }
            Err(e) => {
                error!(
                    event_id = %event.event_id,
                    dlq_subject = %subject,
                    error = %e,
                    "Failed to publish to dead-letter queue, leaving message for redelivery"
                );
                let first_attempt_at = details.first_attempt_at;
                self.attempts
                    .entry(tracking_id.to_string())
                    .or_insert_with(|| AttemptState {
                        naks: 0,
                        first_attempt_at,
                        dead_letter: None,
                    })
                    .dead_letter = Some((ctx.attempt, details));

                if let Err(e) = message.nak().await {
                    warn!(subject = %ctx.subject, error = %e, "Failed to nak message");
                }

                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = sleep(self.config.backoff_delay(ctx.attempt)) => {}
                }
            }
        }
    }
}

/// Runs several consumers as independent tasks until all of them stop.
///
/// The first consumer error is returned after the others have finished.
pub async fn run_consumers(
    consumers: Vec<MessageConsumer>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), Error> {
    let mut tasks = JoinSet::new();
    for consumer in consumers {
        tasks.spawn(consumer.run(shutdown.clone()));
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        let outcome = joined
            .map_err(|e| anyhow!("Consumer task panicked: {}", e))
            .and_then(|result| result);

        if let Err(e) = outcome {
            error!(error = %e, "Consumer stopped with error");
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clients::{
            broker::{Acker, BrokerResult},
            memory_broker::InMemoryBroker,
        },
        models::event::Headers,
    };

    struct NoopAcker;

    #[async_trait]
    impl Acker for NoopAcker {
        async fn ack(&self) -> BrokerResult<()> {
            Ok(())
        }

        async fn nak(&self) -> BrokerResult<()> {
            Ok(())
        }
    }

    fn delivery(id: &str) -> BrokerMessage {
        BrokerMessage::new(
            "events.order.created",
            b"{}".to_vec(),
            Headers::new(),
            Box::new(NoopAcker),
        )
        .with_message_id(Some(id.to_string()))
    }

    fn consumer(max_tracked: usize) -> MessageConsumer {
        let mut consumer = MessageConsumer::new(
            Arc::new(InMemoryBroker::new()),
            handler_fn(|_ctx: ConsumerContext| async { Ok(ProcessingResult::Success) }),
            ConsumerConfig::new("orders_worker", "events.>"),
        );
        consumer.max_tracked = max_tracked;
        consumer
    }

    #[test]
    fn test_attempt_tracking_evicts_oldest_first() {
        let mut consumer = consumer(20);
        let start = Utc::now();

        for i in 0..20 {
            consumer.attempts.insert(
                format!("msg-{}", i),
                AttemptState {
                    naks: 1,
                    first_attempt_at: start + chrono::Duration::seconds(i),
                    dead_letter: None,
                },
            );
        }

        consumer.attempt_for(&delivery("msg-new"), "msg-new");

        assert_eq!(consumer.attempts.len(), 19);
        assert!(!consumer.attempts.contains_key("msg-0"));
        assert!(!consumer.attempts.contains_key("msg-1"));
        assert!(consumer.attempts.contains_key("msg-2"));
        assert!(consumer.attempts.contains_key("msg-new"));

        consumer.attempt_for(&delivery("msg-other"), "msg-other");
        assert_eq!(consumer.attempts.len(), 20);

        // Redeliveries of tracked messages keep their counters.
        let (attempt, _) = consumer.attempt_for(&delivery("msg-5"), "msg-5");
        assert_eq!(attempt, 1);
        assert_eq!(consumer.attempts.len(), 20);
    }

    #[test]
    fn test_delivery_past_budget_dead_letters_directly() {
        let consumer = consumer(20);
        let max_retries = consumer.config.max_retries;
        let now = Utc::now();

        assert!(
            consumer
                .pending_dead_letter("msg-1", max_retries, now)
                .is_none()
        );

        let (attempt, details) = consumer
            .pending_dead_letter("msg-1", max_retries + 1, now)
            .expect("past budget");
        assert_eq!(attempt, max_retries);
        assert_eq!(details.error_type, RETRY_EXHAUSTED_ERROR);
        assert_eq!(details.reason, DlqReason::MaxRetriesExceeded);
    }
}
