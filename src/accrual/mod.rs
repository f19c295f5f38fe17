//! Accrual Scheduler
//!
//! On every tick the scheduler works out the current accrual period and, if
//! no [`AccrualJobRun`] exists for it yet, deposits
//! `round(balance * rate_per_period)` into every interest-eligible account
//! through the Ledger Engine. Each deposit's idempotency key is derived from
//! (period, account), so overlapping or repeated runs credit an account at
//! most once per period.

mod calendar;
mod scheduler;

pub use calendar::{AccrualCalendar, AccrualPeriod, AccrualPolicy};
pub use scheduler::{accrual_key, AccrualScheduler};

use crate::types::{AccrualJobRun, LedgerError, OperationError, PeriodIndex};
use thiserror::Error;

/// Result of a run that did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccrualOutcome {
    /// This call credited the period and recorded the run
    Completed(AccrualJobRun),

    /// The period had already been recorded; nothing was credited
    AlreadyRecorded(AccrualJobRun),
}

impl AccrualOutcome {
    pub fn run(&self) -> &AccrualJobRun {
        match self {
            AccrualOutcome::Completed(run) | AccrualOutcome::AlreadyRecorded(run) => run,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum AccrualError {
    /// Some deposits failed; the run was not recorded and may be retried
    #[error("Accrual for period {period} incomplete: {credited} credited, {} failed", failed.len())]
    Incomplete {
        period: PeriodIndex,
        credited: u64,
        failed: Vec<OperationError>,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Invalid accrual calendar: {message}")]
    InvalidCalendar { message: String },
}
