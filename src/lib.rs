//! Bank Ledger Engine Library
//! # Overview
//!
//! A transactional ledger for deposits, withdrawals and transfers between
//! bank accounts, with periodic interest accrual and paginated history.
//! Every balance change commits atomically with its history entries, each
//! operation applies at most once per idempotency key, and concurrent
//! operations on shared accounts serialize through per-account row locks
//! taken in a canonical order.
//!
//! # Architecture
//!
//! - [`types`] - Core data types (Account, Operation, HistoryEntry, errors)
//! - [`storage`] - Storage Gateway trait with in-memory and PostgreSQL backends
//! - [`core`] - Business logic components:
//!   - [`core::registry`] - Account Registry (immutable facts, read-through cache)
//!   - [`core::engine`] - Ledger Engine (lock, check, update, append, commit)
//!   - [`core::batch_processor`] - Concurrent batch application
//! - [`accrual`] - Accrual Scheduler (exactly-once interest per period)
//! - [`history`] - History Query Service (pages, turnover, statements)
//! - [`config`] / [`logging`] - YAML configuration and tracing setup
//! - [`io`] - CSV input and output
//! - [`cli`] - Command-line interface
//!
//! # Operation Types
//!
//! - **Deposit**: Credit funds to an account
//! - **Withdrawal**: Debit funds (requires sufficient balance unless the
//!   account has a credit line)
//! - **Transfer**: Debit one account and credit another in the same currency

pub mod accrual;
pub mod cli;
pub mod config;
pub mod core;
pub mod history;
pub mod io;
pub mod logging;
pub mod storage;
pub mod types;

pub use accrual::{AccrualOutcome, AccrualScheduler};
pub use config::AppConfig;
pub use core::{AccountRegistry, BatchProcessor, LedgerEngine, Receipt, RetryPolicy};
pub use history::{HistoryQueryService, PageToken};
pub use storage::{MemoryStore, PgStore, StorageGateway};
pub use types::{
    Account, AccountId, HistoryEntry, IdempotencyKey, LedgerError, Operation, OperationError,
    OperationKind,
};
