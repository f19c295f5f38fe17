//! Error types for the ledger
//!
//! This module defines the failure taxonomy shared by every component.
//!
//! # Error Categories
//!
//! - **Validation errors**: invalid amount, self transfer, currency mismatch,
//!   malformed page token. Rejected before anything is locked.
//! - **Lookup errors**: unknown account.
//! - **Business rule errors**: insufficient funds, arithmetic overflow.
//!   Detected under lock; the transaction is aborted and nothing is committed.
//! - **Infrastructure errors**: retry bound exhausted, persistence failure.
//!   Safe to resubmit with the same idempotency key.

use super::account::{AccountId, Currency};
use super::operation::IdempotencyKey;
use rust_decimal::Decimal;
use thiserror::Error;

/// Ledger failure taxonomy
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LedgerError {
    /// Amount is zero or negative
    #[error("Invalid amount {amount}: amounts must be positive")]
    InvalidAmount {
        /// The rejected amount
        amount: Decimal,
    },

    /// Account identifier is unknown
    #[error("Account {account} not found")]
    AccountNotFound {
        /// The unknown account
        account: AccountId,
    },

    /// Transfer endpoints use different currencies
    #[error("Currency mismatch: {from} is {from_currency}, {to} is {to_currency}")]
    CurrencyMismatch {
        from: AccountId,
        from_currency: Currency,
        to: AccountId,
        to_currency: Currency,
    },

    /// Transfer whose source and destination are the same account
    #[error("Cannot transfer from account {account} to itself")]
    SelfTransfer { account: AccountId },

    /// Debit would take an account without a credit line below zero
    ///
    /// Checked against the balance read under lock, not a cached one.
    #[error("Insufficient funds in account {account}: available {available}, requested {requested}")]
    InsufficientFunds {
        account: AccountId,
        available: Decimal,
        requested: Decimal,
    },

    /// Balance arithmetic would leave the decimal range
    #[error("Arithmetic overflow applying delta to account {account}")]
    ArithmeticOverflow { account: AccountId },

    /// The store kept reporting conflicts until the retry bound ran out
    #[error("Concurrent modification: gave up after {attempts} attempts")]
    ConcurrentModificationExceeded { attempts: u32 },

    /// Store unreachable or transaction infrastructure failed
    #[error("Persistence failure: {message}")]
    PersistenceFailure { message: String },

    /// History page token could not be decoded
    #[error("Invalid page token '{token}'")]
    InvalidPageToken { token: String },

    /// Client operation used a key from the interest-credit namespace
    #[error("Idempotency key '{key}' is reserved for interest accrual")]
    ReservedKey { key: IdempotencyKey },
}

impl LedgerError {
    pub fn invalid_amount(amount: Decimal) -> Self {
        LedgerError::InvalidAmount { amount }
    }

    pub fn account_not_found(account: &AccountId) -> Self {
        LedgerError::AccountNotFound {
            account: account.clone(),
        }
    }

    pub fn currency_mismatch(
        from: &AccountId,
        from_currency: &Currency,
        to: &AccountId,
        to_currency: &Currency,
    ) -> Self {
        LedgerError::CurrencyMismatch {
            from: from.clone(),
            from_currency: from_currency.clone(),
            to: to.clone(),
            to_currency: to_currency.clone(),
        }
    }

    pub fn insufficient_funds(account: &AccountId, available: Decimal, requested: Decimal) -> Self {
        LedgerError::InsufficientFunds {
            account: account.clone(),
            available,
            requested,
        }
    }

    pub fn arithmetic_overflow(account: &AccountId) -> Self {
        LedgerError::ArithmeticOverflow {
            account: account.clone(),
        }
    }

    pub fn persistence_failure(message: impl Into<String>) -> Self {
        LedgerError::PersistenceFailure {
            message: message.into(),
        }
    }

    /// HTTP status the front end reports for this failure
    pub fn status_code(&self) -> u16 {
        match self {
            LedgerError::InvalidAmount { .. }
            | LedgerError::CurrencyMismatch { .. }
            | LedgerError::SelfTransfer { .. }
            | LedgerError::ArithmeticOverflow { .. }
            | LedgerError::InvalidPageToken { .. }
            | LedgerError::ReservedKey { .. } => 400,
            LedgerError::AccountNotFound { .. } => 404,
            LedgerError::InsufficientFunds { .. }
            | LedgerError::ConcurrentModificationExceeded { .. } => 409,
            LedgerError::PersistenceFailure { .. } => 503,
        }
    }

    /// Whether resubmitting the same request may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LedgerError::ConcurrentModificationExceeded { .. }
                | LedgerError::PersistenceFailure { .. }
        )
    }
}

/// Failure of one ledger operation
///
/// Always carries the operation's idempotency key so the caller can resubmit
/// without risking a double application.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("Operation {key} failed: {source}")]
pub struct OperationError {
    pub key: IdempotencyKey,
    pub source: LedgerError,
}

impl OperationError {
    pub fn new(key: &IdempotencyKey, source: LedgerError) -> Self {
        Self {
            key: key.clone(),
            source,
        }
    }

    pub fn kind(&self) -> &LedgerError {
        &self.source
    }

    pub fn status_code(&self) -> u16 {
        self.source.status_code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use rust_decimal_macros::dec;

    #[rstest]
    #[case::invalid_amount(
        LedgerError::invalid_amount(dec!(-5)),
        "Invalid amount -5: amounts must be positive"
    )]
    #[case::account_not_found(
        LedgerError::account_not_found(&AccountId::new("ACC-1")),
        "Account ACC-1 not found"
    )]
    #[case::currency_mismatch(
        LedgerError::currency_mismatch(
            &AccountId::new("A"), &Currency::new("USD"),
            &AccountId::new("B"), &Currency::new("EUR"),
        ),
        "Currency mismatch: A is USD, B is EUR"
    )]
    #[case::insufficient_funds(
        LedgerError::insufficient_funds(&AccountId::new("A"), dec!(70.00), dec!(200.00)),
        "Insufficient funds in account A: available 70.00, requested 200.00"
    )]
    #[case::retries_exhausted(
        LedgerError::ConcurrentModificationExceeded { attempts: 5 },
        "Concurrent modification: gave up after 5 attempts"
    )]
    #[case::persistence(
        LedgerError::persistence_failure("connection refused"),
        "Persistence failure: connection refused"
    )]
    fn test_error_display(#[case] error: LedgerError, #[case] expected: &str) {
        assert_eq!(error.to_string(), expected);
    }

    #[rstest]
    #[case::invalid_amount(LedgerError::invalid_amount(dec!(0)), 400)]
    #[case::currency_mismatch(
        LedgerError::currency_mismatch(
            &AccountId::new("A"), &Currency::new("USD"),
            &AccountId::new("B"), &Currency::new("EUR"),
        ),
        400
    )]
    #[case::not_found(LedgerError::account_not_found(&AccountId::new("A")), 404)]
    #[case::insufficient(
        LedgerError::insufficient_funds(&AccountId::new("A"), dec!(1), dec!(2)),
        409
    )]
    #[case::retries(LedgerError::ConcurrentModificationExceeded { attempts: 3 }, 409)]
    #[case::persistence(LedgerError::persistence_failure("down"), 503)]
    #[case::reserved_key(LedgerError::ReservedKey { key: IdempotencyKey::new("accrual:1:A") }, 400)]
    fn test_status_codes(#[case] error: LedgerError, #[case] expected: u16) {
        assert_eq!(error.status_code(), expected);
    }

    #[test]
    fn test_operation_error_carries_key() {
        let error = OperationError::new(
            &IdempotencyKey::new("req-42"),
            LedgerError::insufficient_funds(&AccountId::new("A"), dec!(1), dec!(2)),
        );

        assert_eq!(error.key.as_str(), "req-42");
        assert!(error.to_string().starts_with("Operation req-42 failed: "));
        assert_eq!(error.status_code(), 409);
        assert!(!error.kind().is_transient());
    }
}
