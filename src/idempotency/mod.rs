pub mod checker;
pub mod handler;
pub mod scope;
pub mod wrapper;

pub use checker::IdempotencyChecker;
pub use handler::{IdempotentHandler, with_idempotency};
pub use scope::IdempotencyScope;
pub use wrapper::{
    Idempotent, IdempotencyError, IdempotencyOptions, IdempotentFn, idempotent,
    process_with_idempotency,
};
