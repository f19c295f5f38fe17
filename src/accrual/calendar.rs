//! Accrual periods and interest computation

use super::AccrualError;
use crate::types::PeriodIndex;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::{Decimal, RoundingStrategy};

/// One accrual period `[starts_at, ends_at)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccrualPeriod {
    pub index: PeriodIndex,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
}

/// Fixed-length periods counted from an anchor instant
///
/// Period 0 starts at the anchor; instants before it fall in negative periods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccrualCalendar {
    anchor: DateTime<Utc>,
    length: Duration,
}

impl AccrualCalendar {
    pub fn new(anchor: DateTime<Utc>, length: std::time::Duration) -> Result<Self, AccrualError> {
        let length = Duration::from_std(length)
            .ok()
            .filter(|length| length.num_milliseconds() > 0)
            .ok_or_else(|| AccrualError::InvalidCalendar {
                message: format!("period length {length:?} must be at least one millisecond"),
            })?;
        Ok(Self { anchor, length })
    }

    pub fn anchor(&self) -> DateTime<Utc> {
        self.anchor
    }

    pub fn length(&self) -> Duration {
        self.length
    }

    /// The period containing `at`
    pub fn period_at(&self, at: DateTime<Utc>) -> AccrualPeriod {
        let elapsed = (at - self.anchor).num_milliseconds();
        self.period(elapsed.div_euclid(self.length.num_milliseconds()))
    }

    pub fn period(&self, index: PeriodIndex) -> AccrualPeriod {
        let length = self.length.num_milliseconds();
        let boundary = |index: PeriodIndex| {
            self.anchor
                .checked_add_signed(Duration::milliseconds(length.saturating_mul(index)))
                .unwrap_or(if index < 0 {
                    DateTime::<Utc>::MIN_UTC
                } else {
                    DateTime::<Utc>::MAX_UTC
                })
        };

        AccrualPeriod {
            index,
            starts_at: boundary(index),
            ends_at: boundary(index.saturating_add(1)),
        }
    }
}

/// Rate and rounding applied to each eligible balance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccrualPolicy {
    /// Interest rate for one period, e.g. `0.001` for 0.1%
    pub rate_per_period: Decimal,

    /// Decimal places interest is rounded to (banker's rounding)
    pub scale: u32,
}

impl AccrualPolicy {
    /// Interest owed on `balance` for one period
    ///
    /// `None` when nothing is owed: non-positive balance, non-positive rate,
    /// an amount that rounds to zero, or arithmetic overflow.
    pub fn interest_on(&self, balance: Decimal) -> Option<Decimal> {
        if balance <= Decimal::ZERO {
            return None;
        }

        let interest = balance
            .checked_mul(self.rate_per_period)?
            .round_dp_with_strategy(self.scale, RoundingStrategy::MidpointNearestEven);

        (interest > Decimal::ZERO).then_some(interest)
    }
}
