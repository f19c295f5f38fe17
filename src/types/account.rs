//! Account-related types for the ledger
//!
//! An account is split in two halves:
//! - [`AccountFacts`]: identity, owner, currency and policy flags. These never
//!   change after provisioning and are safe to cache indefinitely.
//! - [`AccountState`]: balance and version. These are only trusted when read
//!   under a row lock inside a storage transaction.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, unique account identifier
///
/// Identifiers are compared lexicographically; that comparison is the
/// canonical total order used whenever several accounts are locked together.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AccountId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for AccountId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// ISO-4217 style currency code (stored upper-case)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Currency(String);

impl Currency {
    pub fn new(code: impl AsRef<str>) -> Self {
        Self(code.as_ref().trim().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Immutable facts about an account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountFacts {
    /// The account identifier
    pub id: AccountId,

    /// Identifier of the customer owning the account
    pub owner: String,

    /// Currency every movement on this account is denominated in
    pub currency: Currency,

    /// Credit-line flag
    ///
    /// When false (the default) no committed state may leave the balance
    /// below zero. When true the account may be overdrawn.
    pub allows_negative: bool,

    /// Whether the accrual scheduler credits interest to this account
    pub interest_eligible: bool,

    /// When the account was provisioned
    pub created_at: DateTime<Utc>,
}

/// Mutable half of an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountState {
    /// Current balance (fixed-point decimal)
    pub balance: Decimal,

    /// Incremented by exactly one on every committed balance change
    pub version: u64,
}

/// Full account view: facts plus the state they were read with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub facts: AccountFacts,
    pub state: AccountState,
}

impl Account {
    pub fn id(&self) -> &AccountId {
        &self.facts.id
    }

    pub fn balance(&self) -> Decimal {
        self.state.balance
    }

    /// Check whether `balance` is an acceptable committed balance for this account
    pub fn permits_balance(&self, balance: Decimal) -> bool {
        self.facts.allows_negative || balance >= Decimal::ZERO
    }
}

/// Provisioning request for a new account
///
/// Account creation belongs to an external provisioning path; the ledger
/// only needs it to seed stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccount {
    pub id: AccountId,
    pub owner: String,
    pub currency: Currency,
    pub opening_balance: Decimal,
    pub allows_negative: bool,
    pub interest_eligible: bool,
}

impl NewAccount {
    /// Plain account: no credit line, interest eligible
    pub fn new(
        id: impl Into<AccountId>,
        owner: impl Into<String>,
        currency: impl AsRef<str>,
        opening_balance: Decimal,
    ) -> Self {
        Self {
            id: id.into(),
            owner: owner.into(),
            currency: Currency::new(currency),
            opening_balance,
            allows_negative: false,
            interest_eligible: true,
        }
    }

    pub fn with_credit_line(mut self) -> Self {
        self.allows_negative = true;
        self
    }

    pub fn without_interest(mut self) -> Self {
        self.interest_eligible = false;
        self
    }

    /// Materialise the account as it looks right after provisioning
    pub fn into_account(self, created_at: DateTime<Utc>) -> Account {
        Account {
            facts: AccountFacts {
                id: self.id,
                owner: self.owner,
                currency: self.currency,
                allows_negative: self.allows_negative,
                interest_eligible: self.interest_eligible,
                created_at,
            },
            state: AccountState {
                balance: self.opening_balance,
                version: 0,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_account_ids_order_lexicographically() {
        let mut ids = vec![AccountId::new("B-2"), AccountId::new("A-9"), AccountId::new("B-10")];
        ids.sort();
        assert_eq!(
            ids,
            vec![AccountId::new("A-9"), AccountId::new("B-10"), AccountId::new("B-2")]
        );
    }

    #[test]
    fn test_account_id_conversions_agree() {
        let from_str: AccountId = "acc-1".into();
        let from_string: AccountId = String::from("acc-1").into();
        assert_eq!(from_str, from_string);
        assert_eq!(from_string.to_string(), "acc-1");
    }

    #[test]
    fn test_currency_is_normalised() {
        assert_eq!(Currency::new(" usd "), Currency::new("USD"));
        assert_eq!(Currency::new("eur").as_str(), "EUR");
    }

    #[test]
    fn test_new_account_defaults() {
        let account = NewAccount::new("A", "alice", "USD", dec!(100.00)).into_account(Utc::now());

        assert_eq!(account.balance(), dec!(100.00));
        assert_eq!(account.state.version, 0);
        assert!(!account.facts.allows_negative);
        assert!(account.facts.interest_eligible);
    }

    #[test]
    fn test_permits_balance_respects_credit_line() {
        let plain = NewAccount::new("A", "alice", "USD", dec!(0)).into_account(Utc::now());
        let credit = NewAccount::new("B", "bob", "USD", dec!(0))
            .with_credit_line()
            .into_account(Utc::now());

        assert!(plain.permits_balance(dec!(0)));
        assert!(!plain.permits_balance(dec!(-0.01)));
        assert!(credit.permits_balance(dec!(-500)));
    }
}
