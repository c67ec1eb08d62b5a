pub mod broker;
pub mod health;
pub mod memory;
pub mod memory_broker;
pub mod postgres;
pub mod rbmq;
pub mod redis;
pub mod store;
