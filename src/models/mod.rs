pub mod consumer;
pub mod dlq;
pub mod event;
pub mod health;
pub mod idempotency;
pub mod retry;
