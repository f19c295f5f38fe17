//! Storage Gateway
//!
//! Thin abstraction over the persistent store, which is the single source of
//! truth for balances. Two traits split the surface:
//!
//! - [`StorageGateway`]: opens transactions and answers read-only snapshot
//!   queries that never block the write path.
//! - [`StoreTransaction`]: the transactional primitives (row locks,
//!   idempotency lookups, balance updates, history appends). They exist only
//!   on a live transaction value, so calling one outside a transaction cannot
//!   be expressed.
//!
//! Dropping a transaction without committing rolls it back.
//!
//! # Backends
//!
//! - [`memory::MemoryStore`]: in-process store with per-row async locks
//! - [`postgres::PgStore`]: PostgreSQL through sqlx

pub mod memory;
pub mod postgres;
pub mod schema;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::types::{
    Account, AccountId, AccrualJobRun, HistoryEntry, HistoryLeg, IdempotencyScope, LedgerError,
    NewAccount, PeriodIndex, SequenceNumber, TimeWindow,
};
use async_trait::async_trait;
use futures::future::BoxFuture;
use rust_decimal::Decimal;
use thiserror::Error;

/// Errors reported by a storage backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Serialization failure, deadlock, unique violation or lock wait timeout
    ///
    /// The whole operation may be retried.
    #[error("Transaction conflict: {reason}")]
    Conflict { reason: String },

    #[error("Account {account} does not exist")]
    MissingAccount { account: AccountId },

    #[error("Account {account} already exists")]
    DuplicateAccount { account: AccountId },

    /// Store unreachable or transaction infrastructure failure
    #[error("Store unavailable: {message}")]
    Unavailable { message: String },

    /// Gateway used against its contract (programming error, never retried)
    #[error("Storage protocol violation: {message}")]
    Protocol { message: String },
}

impl StoreError {
    pub fn conflict(reason: impl Into<String>) -> Self {
        StoreError::Conflict {
            reason: reason.into(),
        }
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        StoreError::Unavailable {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        StoreError::Protocol {
            message: message.into(),
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

impl From<StoreError> for LedgerError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::MissingAccount { account } => LedgerError::AccountNotFound { account },
            other => LedgerError::persistence_failure(other.to_string()),
        }
    }
}

/// Accounts to lock, in canonical order
///
/// The only constructor sorts and de-duplicates, so every multi-account
/// lock request is issued in the same relative order and cyclic waits
/// cannot form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockOrder(Vec<AccountId>);

impl LockOrder {
    pub fn new<I>(ids: I) -> Self
    where
        I: IntoIterator<Item = AccountId>,
    {
        let mut ids: Vec<AccountId> = ids.into_iter().collect();
        ids.sort();
        ids.dedup();
        Self(ids)
    }

    pub fn ids(&self) -> &[AccountId] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Entry point to a storage backend
#[async_trait]
pub trait StorageGateway: Send + Sync + 'static {
    type Tx: StoreTransaction;

    /// Open a transaction
    ///
    /// Rows returned by `lock_accounts_for_update` are the latest committed
    /// versions and stay unchanged by others until this transaction ends.
    async fn begin(&self) -> Result<Self::Tx, StoreError>;

    /// Provision a new account (external provisioning path)
    async fn create_account(&self, account: NewAccount) -> Result<Account, StoreError>;

    /// Snapshot read of one account
    async fn account(&self, id: &AccountId) -> Result<Option<Account>, StoreError>;

    /// Snapshot read of every account, ordered by id
    async fn list_accounts(&self) -> Result<Vec<Account>, StoreError>;

    /// Entries committed under `scope`, if any
    async fn committed_operation(
        &self,
        scope: &IdempotencyScope,
    ) -> Result<Option<Vec<HistoryEntry>>, StoreError>;

    /// Up to `limit` entries of `account` inside `window` with a sequence
    /// number greater than `after`, ascending
    async fn history(
        &self,
        account: &AccountId,
        window: TimeWindow,
        after: Option<SequenceNumber>,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, StoreError>;

    async fn accrual_run(&self, period: PeriodIndex) -> Result<Option<AccrualJobRun>, StoreError>;
}

/// Transactional primitives
#[async_trait]
pub trait StoreTransaction: Send {
    /// Take exclusive row locks in the given order and return the locked rows
    ///
    /// Each transaction locks at most once; a bounded lock wait that expires
    /// is reported as [`StoreError::Conflict`].
    async fn lock_accounts_for_update(&mut self, order: &LockOrder)
        -> Result<Vec<Account>, StoreError>;

    /// Idempotency lookup covered by this transaction
    async fn committed_operation(
        &mut self,
        scope: &IdempotencyScope,
    ) -> Result<Option<Vec<HistoryEntry>>, StoreError>;

    /// Write a new balance for a locked account and bump its version
    ///
    /// Returns the new version.
    async fn update_balance(
        &mut self,
        account: &AccountId,
        balance: Decimal,
        expected_version: u64,
    ) -> Result<u64, StoreError>;

    /// Sequence and persist history legs, recording `scope` as committed
    async fn append_history(
        &mut self,
        scope: &IdempotencyScope,
        legs: Vec<HistoryLeg>,
    ) -> Result<Vec<HistoryEntry>, StoreError>;

    /// Insert an accrual run record; `false` if the period is already recorded
    async fn record_accrual_run(&mut self, run: &AccrualJobRun) -> Result<bool, StoreError>;

    async fn commit(self) -> Result<(), StoreError>;

    async fn rollback(self) -> Result<(), StoreError>;
}

/// Run `body` inside one store transaction
///
/// Commits when the body succeeds. On failure the transaction is rolled back
/// and the body's error is returned unchanged.
pub async fn with_transaction<S, T, E, F>(store: &S, body: F) -> Result<T, E>
where
    S: StorageGateway,
    T: Send,
    E: From<StoreError> + Send,
    F: for<'t> FnOnce(&'t mut S::Tx) -> BoxFuture<'t, Result<T, E>> + Send,
{
    let mut tx = store.begin().await?;

    match body(&mut tx).await {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(error) => {
            if let Err(rollback_error) = tx.rollback().await {
                tracing::warn!(error = %rollback_error, "Rollback failed");
            }
            Err(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IdempotencyKey, OperationKind};
    use rust_decimal_macros::dec;

    #[test]
    fn test_lock_order_sorts_and_dedups() {
        let order = LockOrder::new(vec![
            AccountId::new("B"),
            AccountId::new("A"),
            AccountId::new("B"),
        ]);
        assert_eq!(order.ids(), &[AccountId::new("A"), AccountId::new("B")]);
    }

    #[test]
    fn test_lock_order_is_direction_independent() {
        let forward = LockOrder::new(vec![AccountId::new("X"), AccountId::new("Y")]);
        let backward = LockOrder::new(vec![AccountId::new("Y"), AccountId::new("X")]);
        assert_eq!(forward, backward);
    }

    #[test]
    fn test_store_error_conversion() {
        let missing: LedgerError = StoreError::MissingAccount {
            account: AccountId::new("A"),
        }
        .into();
        assert_eq!(missing, LedgerError::account_not_found(&AccountId::new("A")));

        let down: LedgerError = StoreError::unavailable("refused").into();
        assert!(matches!(down, LedgerError::PersistenceFailure { .. }));
    }

    fn scope() -> IdempotencyScope {
        IdempotencyScope {
            kind: OperationKind::Deposit,
            from: None,
            to: Some(AccountId::new("A")),
            key: IdempotencyKey::new("k"),
        }
    }

    fn leg(balance_after: Decimal) -> HistoryLeg {
        HistoryLeg {
            account: AccountId::new("A"),
            kind: OperationKind::Deposit,
            counterparty: None,
            amount: dec!(5),
            balance_after,
        }
    }

    #[tokio::test]
    async fn test_with_transaction_commits_on_success() {
        let store = MemoryStore::new();
        store
            .create_account(NewAccount::new("A", "alice", "USD", dec!(10)))
            .await
            .unwrap();

        let result: Result<u64, StoreError> = with_transaction(&store, |tx| {
            Box::pin(async move {
                let rows = tx
                    .lock_accounts_for_update(&LockOrder::new(vec![AccountId::new("A")]))
                    .await?;
                let version = tx
                    .update_balance(&AccountId::new("A"), dec!(15), rows[0].state.version)
                    .await?;
                tx.append_history(&scope(), vec![leg(dec!(15))]).await?;
                Ok(version)
            })
        })
        .await;

        assert_eq!(result, Ok(1));
        let account = store.account(&AccountId::new("A")).await.unwrap().unwrap();
        assert_eq!(account.balance(), dec!(15));
        assert!(store.committed_operation(&scope()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_with_transaction_rolls_back_and_returns_error_unchanged() {
        let store = MemoryStore::new();
        store
            .create_account(NewAccount::new("A", "alice", "USD", dec!(10)))
            .await
            .unwrap();

        let result: Result<(), LedgerError> = with_transaction(&store, |tx| {
            Box::pin(async move {
                let rows = tx
                    .lock_accounts_for_update(&LockOrder::new(vec![AccountId::new("A")]))
                    .await?;
                tx.update_balance(&AccountId::new("A"), dec!(0), rows[0].state.version)
                    .await?;
                tx.append_history(&scope(), vec![leg(dec!(0))]).await?;
                Err(LedgerError::invalid_amount(dec!(-1)))
            })
        })
        .await;

        assert_eq!(result, Err(LedgerError::invalid_amount(dec!(-1))));
        let account = store.account(&AccountId::new("A")).await.unwrap().unwrap();
        assert_eq!(account.balance(), dec!(10));
        assert_eq!(account.state.version, 0);
        assert!(store.committed_operation(&scope()).await.unwrap().is_none());
    }
}
