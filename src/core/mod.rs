//! Core ledger logic
//!
//! - `registry`: immutable account facts (existence, currency, owner)
//! - `engine`: validation, lock ordering, retry and commit of operations
//! - `state`: the per-operation state machine
//! - `retry`: bounded retry with backoff
//! - `batch_processor`: order-preserving concurrent batch application

pub mod batch_processor;
pub mod engine;
pub mod registry;
pub mod retry;
pub mod state;

pub use batch_processor::{BatchProcessor, ProcessingResult};
pub use engine::{LedgerEngine, Receipt};
pub use registry::AccountRegistry;
pub use retry::{Backoff, RetryPolicy};
pub use state::OperationState;
