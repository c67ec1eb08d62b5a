use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::{
    idempotency::{checker::IdempotencyChecker, wrapper::IdempotencyOptions},
    models::{
        consumer::{ConsumerContext, HandlerError, ProcessingResult},
        idempotency::IdempotencyKey,
    },
    workers::consumer::MessageHandler,
};

const PROCESSING_ELSEWHERE: &str = "processing elsewhere";
const DUPLICATE_ERROR: &str = "DuplicateMessage";

/// A [`MessageHandler`] that runs its inner handler at most once per
/// idempotency key.
///
/// Only keys that completed are acked as duplicates. A key held by another
/// worker, or a failed key that someone else is re-acquiring, is retried.
/// Deliveries without an event id or idempotency key go straight through.
pub struct IdempotentHandler<H> {
    checker: IdempotencyChecker,
    inner: H,
    options: IdempotencyOptions,
}

pub fn with_idempotency<H: MessageHandler>(
    checker: IdempotencyChecker,
    handler: H,
    options: IdempotencyOptions,
) -> IdempotentHandler<H> {
    IdempotentHandler {
        checker,
        inner: handler,
        options,
    }
}

impl<H> IdempotentHandler<H> {
    fn key_for(ctx: &ConsumerContext) -> Option<IdempotencyKey> {
        let explicit_key = ctx.idempotency_key();
        let event_id = ctx.event_id();

        if explicit_key.is_none() && event_id.is_none() {
            return None;
        }

        let event_id = event_id.unwrap_or_default();
        let event_type = ctx.event_type().unwrap_or_else(|| ctx.subject.clone());

        Some(IdempotencyKey::resolve(
            &event_id,
            explicit_key.as_deref(),
            &event_type,
        ))
    }
}

#[async_trait]
impl<H: MessageHandler> MessageHandler for IdempotentHandler<H> {
    async fn handle(&self, ctx: &ConsumerContext) -> Result<ProcessingResult, HandlerError> {
        let Some(key) = Self::key_for(ctx) else {
            debug!(subject = %ctx.subject, "No idempotency key on message, processing directly");
            return self.inner.handle(ctx).await;
        };

        let scope = self.checker.begin(&key).await;

        if scope.is_in_progress() {
            info!(
                idempotency_key = %key.key,
                event_id = %key.event_id,
                status = ?scope.record().map(|record| record.status),
                "Key held by another worker, leaving message for redelivery"
            );
            return Ok(ProcessingResult::retry(PROCESSING_ELSEWHERE));
        }

        if scope.is_duplicate() {
            if !self.options.skip_on_duplicate {
                warn!(
                    idempotency_key = %key.key,
                    event_id = %key.event_id,
                    "Duplicate of a completed message, dead-lettering"
                );
                return Ok(ProcessingResult::dead_letter(
                    DUPLICATE_ERROR,
                    format!("duplicate message for idempotency key {}", key.key),
                ));
            }

            info!(
                idempotency_key = %key.key,
                event_id = %key.event_id,
                "Duplicate message, acknowledging without processing"
            );
            return Ok(ProcessingResult::Success);
        }

        match self.inner.handle(ctx).await {
            Ok(ProcessingResult::Success) => {
                scope.complete(None).await;
                Ok(ProcessingResult::Success)
            }
            Ok(ProcessingResult::Retry(reason)) => {
                scope.fail(&reason).await;
                Ok(ProcessingResult::Retry(reason))
            }
            Ok(ProcessingResult::DeadLetter {
                error_type,
                message,
            }) => {
                scope.fail(&format!("{}: {}", error_type, message)).await;
                Ok(ProcessingResult::DeadLetter {
                    error_type,
                    message,
                })
            }
            Err(e) => {
                scope.fail(&e.to_string()).await;
                Err(e)
            }
        }
    }
}
