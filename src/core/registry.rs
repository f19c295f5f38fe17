//! Account Registry
//!
//! Read-through cache of immutable account facts (identity, owner, currency,
//! policy flags). Balances are deliberately absent: the Ledger Engine always
//! re-reads them under a row lock.
//!
//! # Thread Safety
//!
//! Facts live in a `DashMap`, so concurrent lookups of different accounts do
//! not contend. Two tasks missing the cache for the same account may both hit
//! the store; both insert identical facts.

use crate::storage::StorageGateway;
use crate::types::{Account, AccountFacts, AccountId, Currency, LedgerError, NewAccount};
use dashmap::DashMap;
use std::sync::Arc;

/// Identity and currency lookups for the ledger
#[derive(Debug)]
pub struct AccountRegistry<S> {
    store: Arc<S>,

    /// Facts never change after provisioning, so entries are never evicted
    facts: DashMap<AccountId, AccountFacts>,
}

impl<S: StorageGateway> AccountRegistry<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            facts: DashMap::new(),
        }
    }

    /// Immutable facts of `id`
    ///
    /// # Returns
    ///
    /// * `Ok(AccountFacts)` - From the cache, or from a store snapshot read
    /// * `Err(LedgerError::AccountNotFound)` - If the store has no such account
    /// * `Err(LedgerError::PersistenceFailure)` - If the store could not be read
    pub async fn get(&self, id: &AccountId) -> Result<AccountFacts, LedgerError> {
        if let Some(facts) = self.facts.get(id) {
            return Ok(facts.value().clone());
        }

        let account = self
            .store
            .account(id)
            .await?
            .ok_or_else(|| LedgerError::account_not_found(id))?;

        tracing::trace!(account = %id, "Cached account facts");
        Ok(self.remember(account))
    }

    pub async fn exists(&self, id: &AccountId) -> Result<bool, LedgerError> {
        match self.get(id).await {
            Ok(_) => Ok(true),
            Err(LedgerError::AccountNotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn currency_of(&self, id: &AccountId) -> Result<Currency, LedgerError> {
        Ok(self.get(id).await?.currency)
    }

    /// Every account held by `owner`, ordered by id
    pub async fn accounts_of_owner(&self, owner: &str) -> Result<Vec<AccountFacts>, LedgerError> {
        let accounts = self.store.list_accounts().await?;
        Ok(accounts
            .into_iter()
            .filter(|account| account.facts.owner == owner)
            .map(|account| self.remember(account))
            .collect())
    }

    /// Provision a new account through the store and cache its facts
    ///
    /// Account creation is owned by an external provisioning path; this is
    /// the hook it (and seeding) goes through.
    pub async fn provision(&self, account: NewAccount) -> Result<Account, LedgerError> {
        let account = self.store.create_account(account).await?;
        tracing::info!(
            account = %account.id(),
            owner = %account.facts.owner,
            currency = %account.facts.currency,
            balance = %account.balance(),
            "Provisioned account"
        );
        self.facts
            .insert(account.id().clone(), account.facts.clone());
        Ok(account)
    }

    /// Number of accounts whose facts are cached
    pub fn cached(&self) -> usize {
        self.facts.len()
    }

    fn remember(&self, account: Account) -> AccountFacts {
        self.facts
            .entry(account.facts.id.clone())
            .or_insert(account.facts)
            .value()
            .clone()
    }
}
