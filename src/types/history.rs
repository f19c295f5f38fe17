//! Immutable history records
//!
//! Every committed operation leaves one [`HistoryEntry`] per account leg:
//! one for a deposit or withdrawal, two (debit then credit) for a transfer.
//! Entries are append-only and ordered by a global sequence number.

use super::account::AccountId;
use super::operation::{IdempotencyKey, OperationKind};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Global, gap-free, commit-ordered sequence number
pub type SequenceNumber = u64;

/// One committed leg of an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub seq: SequenceNumber,
    pub account: AccountId,
    pub kind: OperationKind,

    /// The other side of a transfer
    pub counterparty: Option<AccountId>,

    /// Negative for a debit, positive for a credit
    pub amount: Decimal,

    /// Account balance right after this leg was applied
    pub balance_after: Decimal,

    pub key: IdempotencyKey,
    pub committed_at: DateTime<Utc>,
}

impl HistoryEntry {
    pub fn is_debit(&self) -> bool {
        self.amount.is_sign_negative()
    }
}

/// A leg computed by the engine, not yet sequenced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryLeg {
    pub account: AccountId,
    pub kind: OperationKind,
    pub counterparty: Option<AccountId>,
    pub amount: Decimal,
    pub balance_after: Decimal,
}

impl HistoryLeg {
    /// Turn the leg into a committed entry
    pub fn sequenced(
        self,
        seq: SequenceNumber,
        key: IdempotencyKey,
        committed_at: DateTime<Utc>,
    ) -> HistoryEntry {
        HistoryEntry {
            seq,
            account: self.account,
            kind: self.kind,
            counterparty: self.counterparty,
            amount: self.amount,
            balance_after: self.balance_after,
            key,
            committed_at,
        }
    }
}

/// Half-open time window `[from, to)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self { from, to }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.from && at < self.to
    }
}
