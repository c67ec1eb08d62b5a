pub mod api;
pub mod clients;
pub mod config;
pub mod context;
pub mod idempotency;
pub mod models;
pub mod utils;
pub mod workers;
