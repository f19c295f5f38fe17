//! Operation types for the ledger
//!
//! An [`Operation`] is a requested balance mutation. It is never mutated after
//! creation: the Ledger Engine either rejects it or turns it into one or two
//! committed history legs.

use super::account::AccountId;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Caller-supplied token identifying one logical request
///
/// Resubmitting an operation with the same key is safe: its effect is
/// committed at most once.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

/// Key namespace of interest credits; client operations may not use it
pub const ACCRUAL_KEY_PREFIX: &str = "accrual:";

impl IdempotencyKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the key lies in the namespace reserved for interest credits
    pub fn is_reserved(&self) -> bool {
        self.0.starts_with(ACCRUAL_KEY_PREFIX)
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdempotencyKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for IdempotencyKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// Kinds of balance-affecting operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    /// Credit funds to one account
    Deposit,

    /// Debit funds from one account
    Withdrawal,

    /// Debit one account and credit another in a single atomic unit
    Transfer,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Deposit => "deposit",
            OperationKind::Withdrawal => "withdrawal",
            OperationKind::Transfer => "transfer",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "deposit" => Ok(OperationKind::Deposit),
            "withdrawal" | "withdraw" => Ok(OperationKind::Withdrawal),
            "transfer" => Ok(OperationKind::Transfer),
            other => Err(format!("Invalid operation type: '{other}'")),
        }
    }
}

/// The accounts an operation moves money between
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Movement {
    Deposit { to: AccountId },
    Withdrawal { from: AccountId },
    Transfer { from: AccountId, to: AccountId },
}

impl Movement {
    pub fn kind(&self) -> OperationKind {
        match self {
            Movement::Deposit { .. } => OperationKind::Deposit,
            Movement::Withdrawal { .. } => OperationKind::Withdrawal,
            Movement::Transfer { .. } => OperationKind::Transfer,
        }
    }

    /// Debited account, if any
    pub fn source(&self) -> Option<&AccountId> {
        match self {
            Movement::Withdrawal { from } | Movement::Transfer { from, .. } => Some(from),
            Movement::Deposit { .. } => None,
        }
    }

    /// Credited account, if any
    pub fn destination(&self) -> Option<&AccountId> {
        match self {
            Movement::Deposit { to } | Movement::Transfer { to, .. } => Some(to),
            Movement::Withdrawal { .. } => None,
        }
    }

    /// Every account touched, source first
    pub fn accounts(&self) -> Vec<&AccountId> {
        self.source().into_iter().chain(self.destination()).collect()
    }
}

/// A requested mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub movement: Movement,

    /// Positive amount in the currency of every endpoint
    pub amount: Decimal,

    pub key: IdempotencyKey,

    pub requested_at: DateTime<Utc>,
}

impl Operation {
    pub fn deposit(to: AccountId, amount: Decimal, key: IdempotencyKey) -> Self {
        Self::new(Movement::Deposit { to }, amount, key)
    }

    pub fn withdrawal(from: AccountId, amount: Decimal, key: IdempotencyKey) -> Self {
        Self::new(Movement::Withdrawal { from }, amount, key)
    }

    pub fn transfer(from: AccountId, to: AccountId, amount: Decimal, key: IdempotencyKey) -> Self {
        Self::new(Movement::Transfer { from, to }, amount, key)
    }

    fn new(movement: Movement, amount: Decimal, key: IdempotencyKey) -> Self {
        Self {
            movement,
            amount,
            key,
            requested_at: Utc::now(),
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.movement.kind()
    }

    /// Scope within which this operation's key must be unique
    pub fn scope(&self) -> IdempotencyScope {
        IdempotencyScope {
            kind: self.kind(),
            from: self.movement.source().cloned(),
            to: self.movement.destination().cloned(),
            key: self.key.clone(),
        }
    }
}

/// Idempotency scope: operation kind, its ordered endpoint(s), and the key
///
/// Deposits and withdrawals are scoped per account, transfers per ordered
/// (from, to) pair, so `transfer(A, B, k)` and `transfer(B, A, k)` are two
/// different logical requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyScope {
    pub kind: OperationKind,
    pub from: Option<AccountId>,
    pub to: Option<AccountId>,
    pub key: IdempotencyKey,
}

impl IdempotencyScope {
    /// Flat string form used as a storage key
    ///
    /// Fields are joined with the ASCII unit separator so identifiers and
    /// keys may contain any printable character.
    pub fn storage_key(&self) -> String {
        const SEP: char = '\u{1f}';
        format!(
            "{}{SEP}{}{SEP}{}{SEP}{}",
            self.kind,
            self.from.as_ref().map(AccountId::as_str).unwrap_or_default(),
            self.to.as_ref().map(AccountId::as_str).unwrap_or_default(),
            self.key
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use rust_decimal_macros::dec;

    #[test]
    fn test_movement_endpoints() {
        let op = Operation::transfer("A".into(), "B".into(), dec!(1), "k".into());
        assert_eq!(op.movement.source(), Some(&AccountId::new("A")));
        assert_eq!(op.movement.destination(), Some(&AccountId::new("B")));
        assert_eq!(op.movement.accounts().len(), 2);

        let op = Operation::deposit("A".into(), dec!(1), "k".into());
        assert_eq!(op.movement.source(), None);
        assert_eq!(op.movement.accounts(), vec![&AccountId::new("A")]);
    }

    #[test]
    fn test_scope_distinguishes_direction_and_kind() {
        let ab = Operation::transfer("A".into(), "B".into(), dec!(1), "k".into());
        let ba = Operation::transfer("B".into(), "A".into(), dec!(1), "k".into());
        assert_ne!(ab.scope(), ba.scope());
        assert_ne!(ab.scope().storage_key(), ba.scope().storage_key());

        let deposit = Operation::deposit("A".into(), dec!(1), "k".into());
        let withdrawal = Operation::withdrawal("A".into(), dec!(1), "k".into());
        assert_ne!(deposit.scope(), withdrawal.scope());
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("Deposit".parse(), Ok(OperationKind::Deposit));
        assert_eq!("withdraw".parse(), Ok(OperationKind::Withdrawal));
        assert_eq!(" transfer ".parse(), Ok(OperationKind::Transfer));
        assert!("dispute".parse::<OperationKind>().is_err());
    }

    #[rstest]
    #[case::accrual("accrual:19783:A", true)]
    #[case::plain("deposit-1", false)]
    #[case::prefix_elsewhere("my-accrual:1", false)]
    #[case::no_separator("accrual", false)]
    fn test_reserved_keys(#[case] key: &str, #[case] reserved: bool) {
        assert_eq!(IdempotencyKey::new(key).is_reserved(), reserved);
    }

    #[test]
    fn test_scope_ignores_amount() {
        let first = Operation::deposit("A".into(), dec!(1), "k".into());
        let retry = Operation::deposit("A".into(), dec!(2), "k".into());
        assert_eq!(first.scope(), retry.scope());
    }
}
