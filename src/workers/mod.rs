pub mod consumer;
pub mod dlq_monitor;

pub use consumer::{MessageConsumer, MessageHandler, handler_fn, run_consumers};
pub use dlq_monitor::{
    AlertOnErrorTypes, Alerter, DlqMonitor, DlqPolicy, LogAlerter, StoreAll, policy_fn,
};
