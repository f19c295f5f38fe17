//! Accrual audit records

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Index of an accrual period (see `accrual::AccrualCalendar`)
pub type PeriodIndex = i64;

/// Record of one completed scheduler run
///
/// Written once, after every eligible account of the period was credited.
/// Its presence is what makes a re-run of the same period a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccrualJobRun {
    pub period: PeriodIndex,

    /// Rate applied for the period
    pub rate: Decimal,

    pub accounts_touched: u64,
    pub total_interest: Decimal,
    pub run_at: DateTime<Utc>,
}
