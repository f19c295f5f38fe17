//! Types module
//!
//! Contains core data structures used throughout the ledger:
//! - `account`: account identity, policy flags and balance state
//! - `operation`: requested mutations and idempotency scopes
//! - `history`: committed, append-only history legs
//! - `accrual`: accrual run audit records
//! - `error`: the ledger error taxonomy

pub mod account;
pub mod accrual;
pub mod error;
pub mod history;
pub mod operation;

pub use account::{Account, AccountFacts, AccountId, AccountState, Currency, NewAccount};
pub use accrual::{AccrualJobRun, PeriodIndex};
pub use error::{LedgerError, OperationError};
pub use history::{HistoryEntry, HistoryLeg, SequenceNumber, TimeWindow};
pub use operation::{
    IdempotencyKey, IdempotencyScope, Movement, Operation, OperationKind, ACCRUAL_KEY_PREFIX,
};
