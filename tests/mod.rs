mod idempotency_tests;
mod infra_tests;
