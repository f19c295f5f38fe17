//! In-process storage backend
//!
//! `MemoryStore` keeps committed rows in `DashMap`s and emulates the locking
//! behaviour of a relational store:
//!
//! - every account row has its own async mutex; a transaction holds the
//!   owned guards until it commits or is dropped
//! - lock waits are bounded; an expired wait is reported as a conflict
//! - writes are buffered in the transaction and published at commit behind
//!   a gate that snapshot readers share, so a reader never sees one leg of a
//!   transfer without the other
//! - sequence numbers come from a single counter locked from the first
//!   history append until commit or rollback, which makes them gap-free and
//!   commit-ordered
//!
//! Fault injection ([`MemoryStore::fail_next_commits`],
//! [`MemoryStore::set_available`]) drives the retry and persistence-failure
//! paths.

use super::{LockOrder, StorageGateway, StoreError, StoreTransaction};
use crate::types::{
    Account, AccountId, AccrualJobRun, HistoryEntry, HistoryLeg, IdempotencyScope, NewAccount,
    PeriodIndex, SequenceNumber, TimeWindow,
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
struct Shared {
    /// Committed account rows
    accounts: DashMap<AccountId, Account>,

    /// One lock per account row
    row_locks: DashMap<AccountId, Arc<Mutex<()>>>,

    /// Committed history per account, ascending by sequence number
    history: DashMap<AccountId, Vec<HistoryEntry>>,

    /// Committed operations keyed by idempotency scope
    operations: DashMap<String, Vec<HistoryEntry>>,

    accrual_runs: DashMap<PeriodIndex, AccrualJobRun>,

    /// Next sequence number to hand out
    sequence: Arc<Mutex<SequenceNumber>>,

    /// Commits publish under the write side, snapshot reads take the read side
    publish: RwLock<()>,

    lock_timeout: Duration,
    failing_commits: AtomicU32,
    unavailable: AtomicBool,
}

/// In-memory storage backend
///
/// Cheap to clone; clones share the same data.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_lock_timeout(DEFAULT_LOCK_TIMEOUT)
    }

    /// Create a store whose row lock waits give up after `lock_timeout`
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                accounts: DashMap::new(),
                row_locks: DashMap::new(),
                history: DashMap::new(),
                operations: DashMap::new(),
                accrual_runs: DashMap::new(),
                sequence: Arc::new(Mutex::new(1)),
                publish: RwLock::new(()),
                lock_timeout,
                failing_commits: AtomicU32::new(0),
                unavailable: AtomicBool::new(false),
            }),
        }
    }

    /// Make the next `count` commits fail with a conflict
    pub fn fail_next_commits(&self, count: u32) {
        self.shared.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Simulate the store going down (`false`) or coming back (`true`)
    pub fn set_available(&self, available: bool) {
        self.shared.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.shared.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("memory store is offline"));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Shared {
    fn take_failing_commit(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl StorageGateway for MemoryStore {
    type Tx = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction, StoreError> {
        self.check_available()?;
        Ok(MemoryTransaction {
            shared: Arc::clone(&self.shared),
            row_guards: Vec::new(),
            locked: Vec::new(),
            sequence: None,
            next_seq: 0,
            entries: Vec::new(),
            operations: Vec::new(),
            accrual_runs: Vec::new(),
        })
    }

    async fn create_account(&self, account: NewAccount) -> Result<Account, StoreError> {
        self.check_available()?;
        let _gate = self.shared.publish.write().await;

        if self.shared.accounts.contains_key(&account.id) {
            return Err(StoreError::DuplicateAccount {
                account: account.id,
            });
        }

        let account = account.into_account(Utc::now());
        self.shared
            .row_locks
            .insert(account.id().clone(), Arc::new(Mutex::new(())));
        self.shared
            .accounts
            .insert(account.id().clone(), account.clone());
        Ok(account)
    }

    async fn account(&self, id: &AccountId) -> Result<Option<Account>, StoreError> {
        self.check_available()?;
        let _gate = self.shared.publish.read().await;
        Ok(self.shared.accounts.get(id).map(|row| row.value().clone()))
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, StoreError> {
        self.check_available()?;
        let _gate = self.shared.publish.read().await;
        let mut accounts: Vec<Account> = self
            .shared
            .accounts
            .iter()
            .map(|row| row.value().clone())
            .collect();
        accounts.sort_by(|a, b| a.id().cmp(b.id()));
        Ok(accounts)
    }

    async fn committed_operation(
        &self,
        scope: &IdempotencyScope,
    ) -> Result<Option<Vec<HistoryEntry>>, StoreError> {
        self.check_available()?;
        let _gate = self.shared.publish.read().await;
        Ok(self
            .shared
            .operations
            .get(&scope.storage_key())
            .map(|entries| entries.value().clone()))
    }

    async fn history(
        &self,
        account: &AccountId,
        window: TimeWindow,
        after: Option<SequenceNumber>,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        self.check_available()?;
        let _gate = self.shared.publish.read().await;
        let after = after.unwrap_or(0);
        Ok(self
            .shared
            .history
            .get(account)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| entry.seq > after && window.contains(entry.committed_at))
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn accrual_run(&self, period: PeriodIndex) -> Result<Option<AccrualJobRun>, StoreError> {
        self.check_available()?;
        let _gate = self.shared.publish.read().await;
        Ok(self
            .shared
            .accrual_runs
            .get(&period)
            .map(|run| run.value().clone()))
    }
}

/// Buffered transaction against a [`MemoryStore`]
///
/// Holds its row locks and, after the first history append, the sequence
/// counter. Dropping it releases both without publishing anything.
#[derive(Debug)]
pub struct MemoryTransaction {
    shared: Arc<Shared>,
    row_guards: Vec<OwnedMutexGuard<()>>,

    /// Locked rows with pending balance changes applied
    locked: Vec<LockedRow>,

    sequence: Option<OwnedMutexGuard<SequenceNumber>>,
    next_seq: SequenceNumber,
    entries: Vec<HistoryEntry>,
    operations: Vec<(String, Vec<HistoryEntry>)>,
    accrual_runs: Vec<AccrualJobRun>,
}

#[derive(Debug)]
struct LockedRow {
    account: Account,
    dirty: bool,
}

impl MemoryTransaction {
    async fn acquire(
        &self,
        lock: Arc<Mutex<()>>,
        what: &str,
    ) -> Result<OwnedMutexGuard<()>, StoreError> {
        tokio::time::timeout(self.shared.lock_timeout, lock.lock_owned())
            .await
            .map_err(|_| StoreError::conflict(format!("lock wait timed out on {what}")))
    }
}

#[async_trait]
impl StoreTransaction for MemoryTransaction {
    async fn lock_accounts_for_update(
        &mut self,
        order: &LockOrder,
    ) -> Result<Vec<Account>, StoreError> {
        if !self.row_guards.is_empty() {
            return Err(StoreError::protocol(
                "accounts already locked in this transaction",
            ));
        }

        for id in order.ids() {
            // Clone the lock out of the map; a map guard must not live across an await
            let lock = self
                .shared
                .row_locks
                .get(id)
                .map(|lock| Arc::clone(lock.value()))
                .ok_or_else(|| StoreError::MissingAccount {
                    account: id.clone(),
                })?;

            let guard = self.acquire(lock, &format!("account {id}")).await?;
            self.row_guards.push(guard);

            let account = self
                .shared
                .accounts
                .get(id)
                .map(|row| row.value().clone())
                .ok_or_else(|| StoreError::MissingAccount {
                    account: id.clone(),
                })?;
            self.locked.push(LockedRow {
                account,
                dirty: false,
            });
        }

        Ok(self.locked.iter().map(|row| row.account.clone()).collect())
    }

    async fn committed_operation(
        &mut self,
        scope: &IdempotencyScope,
    ) -> Result<Option<Vec<HistoryEntry>>, StoreError> {
        Ok(self
            .shared
            .operations
            .get(&scope.storage_key())
            .map(|entries| entries.value().clone()))
    }

    async fn update_balance(
        &mut self,
        account: &AccountId,
        balance: Decimal,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let row = self
            .locked
            .iter_mut()
            .find(|row| row.account.id() == account)
            .ok_or_else(|| {
                StoreError::protocol(format!("account {account} updated without a row lock"))
            })?;

        if row.account.state.version != expected_version {
            return Err(StoreError::conflict(format!(
                "account {account} is at version {}, expected {expected_version}",
                row.account.state.version
            )));
        }

        row.account.state.balance = balance;
        row.account.state.version += 1;
        row.dirty = true;
        Ok(row.account.state.version)
    }

    async fn append_history(
        &mut self,
        scope: &IdempotencyScope,
        legs: Vec<HistoryLeg>,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let storage_key = scope.storage_key();
        if self.shared.operations.contains_key(&storage_key) {
            return Err(StoreError::conflict(format!(
                "operation {} already committed",
                scope.key
            )));
        }

        if self.sequence.is_none() {
            let guard = tokio::time::timeout(
                self.shared.lock_timeout,
                Arc::clone(&self.shared.sequence).lock_owned(),
            )
            .await
            .map_err(|_| StoreError::conflict("lock wait timed out on sequence counter"))?;
            self.next_seq = *guard;
            self.sequence = Some(guard);
        }

        let committed_at = Utc::now();
        let mut appended = Vec::with_capacity(legs.len());
        for leg in legs {
            let entry = leg.sequenced(self.next_seq, scope.key.clone(), committed_at);
            self.next_seq += 1;
            appended.push(entry);
        }

        self.entries.extend(appended.iter().cloned());
        self.operations.push((storage_key, appended.clone()));
        Ok(appended)
    }

    async fn record_accrual_run(&mut self, run: &AccrualJobRun) -> Result<bool, StoreError> {
        let pending = self.accrual_runs.iter().any(|r| r.period == run.period);
        if pending || self.shared.accrual_runs.contains_key(&run.period) {
            return Ok(false);
        }
        self.accrual_runs.push(run.clone());
        Ok(true)
    }

    async fn commit(self) -> Result<(), StoreError> {
        let MemoryTransaction {
            shared,
            row_guards,
            locked,
            sequence,
            next_seq,
            entries,
            operations,
            accrual_runs,
        } = self;

        if shared.take_failing_commit() {
            return Err(StoreError::conflict("injected commit failure"));
        }
        if shared.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::unavailable("memory store is offline"));
        }

        let _gate = shared.publish.write().await;

        // Unique constraints, checked again now that the gate is exclusive
        if let Some((_, entries)) = operations
            .iter()
            .find(|(key, _)| shared.operations.contains_key(key))
        {
            let key = entries.first().map(|e| e.key.to_string()).unwrap_or_default();
            return Err(StoreError::conflict(format!("operation {key} already committed")));
        }
        if let Some(run) = accrual_runs
            .iter()
            .find(|run| shared.accrual_runs.contains_key(&run.period))
        {
            return Err(StoreError::conflict(format!(
                "accrual period {} already recorded",
                run.period
            )));
        }

        for row in locked.into_iter().filter(|row| row.dirty) {
            shared.accounts.insert(row.account.id().clone(), row.account);
        }
        for entry in entries {
            shared
                .history
                .entry(entry.account.clone())
                .or_default()
                .push(entry);
        }
        for (key, entries) in operations {
            shared.operations.insert(key, entries);
        }
        for run in accrual_runs {
            shared.accrual_runs.insert(run.period, run);
        }
        if let Some(mut counter) = sequence {
            *counter = next_seq;
        }

        drop(row_guards);
        Ok(())
    }

    async fn rollback(self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{IdempotencyKey, OperationKind};
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;

    async fn store_with(ids: &[&str]) -> MemoryStore {
        let store = MemoryStore::with_lock_timeout(Duration::from_millis(100));
        for id in ids {
            store
                .create_account(NewAccount::new(*id, "owner", "USD", dec!(100)))
                .await
                .unwrap();
        }
        store
    }

    fn order(ids: &[&str]) -> LockOrder {
        LockOrder::new(ids.iter().map(|id| AccountId::new(*id)))
    }

    fn scope(key: &str) -> IdempotencyScope {
        IdempotencyScope {
            kind: OperationKind::Deposit,
            from: None,
            to: Some(AccountId::new("A")),
            key: IdempotencyKey::new(key),
        }
    }

    fn deposit_leg(amount: Decimal, balance_after: Decimal) -> HistoryLeg {
        HistoryLeg {
            account: AccountId::new("A"),
            kind: OperationKind::Deposit,
            counterparty: None,
            amount,
            balance_after,
        }
    }

    fn everything() -> TimeWindow {
        let now = Utc::now();
        TimeWindow::new(now - ChronoDuration::days(1), now + ChronoDuration::days(1))
    }

    #[tokio::test]
    async fn test_create_account_rejects_duplicates() {
        let store = store_with(&["A"]).await;
        let result = store
            .create_account(NewAccount::new("A", "owner", "USD", dec!(0)))
            .await;
        assert!(matches!(result, Err(StoreError::DuplicateAccount { .. })));
    }

    #[tokio::test]
    async fn test_lock_returns_rows_in_lock_order() {
        let store = store_with(&["B", "A"]).await;
        let mut tx = store.begin().await.unwrap();

        let rows = tx.lock_accounts_for_update(&order(&["B", "A"])).await.unwrap();

        let ids: Vec<&str> = rows.iter().map(|r| r.id().as_str()).collect();
        assert_eq!(ids, vec!["A", "B"]);
    }

    #[tokio::test]
    async fn test_locking_twice_is_a_protocol_error() {
        let store = store_with(&["A"]).await;
        let mut tx = store.begin().await.unwrap();
        tx.lock_accounts_for_update(&order(&["A"])).await.unwrap();

        let result = tx.lock_accounts_for_update(&order(&["A"])).await;
        assert!(matches!(result, Err(StoreError::Protocol { .. })));
    }

    #[tokio::test]
    async fn test_missing_account_is_reported() {
        let store = store_with(&["A"]).await;
        let mut tx = store.begin().await.unwrap();

        let result = tx.lock_accounts_for_update(&order(&["A", "Z"])).await;
        assert_eq!(
            result,
            Err(StoreError::MissingAccount {
                account: AccountId::new("Z")
            })
        );
    }

    #[tokio::test]
    async fn test_lock_wait_times_out_as_conflict() {
        let store = store_with(&["A"]).await;
        let mut holder = store.begin().await.unwrap();
        holder.lock_accounts_for_update(&order(&["A"])).await.unwrap();

        let mut waiter = store.begin().await.unwrap();
        let result = waiter.lock_accounts_for_update(&order(&["A"])).await;

        assert!(matches!(result, Err(StoreError::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_dropped_transaction_releases_locks_and_publishes_nothing() {
        let store = store_with(&["A"]).await;
        {
            let mut tx = store.begin().await.unwrap();
            tx.lock_accounts_for_update(&order(&["A"])).await.unwrap();
            tx.update_balance(&AccountId::new("A"), dec!(1), 0).await.unwrap();
            tx.append_history(&scope("k"), vec![deposit_leg(dec!(-99), dec!(1))])
                .await
                .unwrap();
        }

        let mut tx = store.begin().await.unwrap();
        let rows = tx.lock_accounts_for_update(&order(&["A"])).await.unwrap();
        assert_eq!(rows[0].balance(), dec!(100));

        // The rolled-back transaction's sequence number is reused
        let entries = tx
            .append_history(&scope("k2"), vec![deposit_leg(dec!(1), dec!(101))])
            .await
            .unwrap();
        assert_eq!(entries[0].seq, 1);
    }

    #[tokio::test]
    async fn test_stale_version_is_a_conflict() {
        let store = store_with(&["A"]).await;
        let mut tx = store.begin().await.unwrap();
        tx.lock_accounts_for_update(&order(&["A"])).await.unwrap();

        let result = tx.update_balance(&AccountId::new("A"), dec!(1), 7).await;
        assert!(matches!(result, Err(StoreError::Conflict { .. })));
    }

    #[tokio::test]
    async fn test_update_without_lock_is_a_protocol_error() {
        let store = store_with(&["A"]).await;
        let mut tx = store.begin().await.unwrap();

        let result = tx.update_balance(&AccountId::new("A"), dec!(1), 0).await;
        assert!(matches!(result, Err(StoreError::Protocol { .. })));
    }

    #[tokio::test]
    async fn test_sequence_numbers_are_contiguous_across_commits() {
        let store = store_with(&["A"]).await;

        for (i, key) in ["k1", "k2", "k3"].iter().enumerate() {
            let mut tx = store.begin().await.unwrap();
            tx.lock_accounts_for_update(&order(&["A"])).await.unwrap();
            let balance = dec!(100) + Decimal::from(i + 1);
            tx.update_balance(&AccountId::new("A"), balance, i as u64)
                .await
                .unwrap();
            tx.append_history(&scope(key), vec![deposit_leg(dec!(1), balance)])
                .await
                .unwrap();
            tx.commit().await.unwrap();
        }

        let history = store
            .history(&AccountId::new("A"), everything(), None, 10)
            .await
            .unwrap();
        let seqs: Vec<u64> = history.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        let page = store
            .history(&AccountId::new("A"), everything(), Some(1), 1)
            .await
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].seq, 2);
    }

    #[tokio::test]
    async fn test_injected_commit_failure_rolls_back() {
        let store = store_with(&["A"]).await;
        store.fail_next_commits(1);

        let mut tx = store.begin().await.unwrap();
        tx.lock_accounts_for_update(&order(&["A"])).await.unwrap();
        tx.update_balance(&AccountId::new("A"), dec!(5), 0).await.unwrap();
        let result = tx.commit().await;

        assert!(matches!(result, Err(StoreError::Conflict { .. })));
        let account = store.account(&AccountId::new("A")).await.unwrap().unwrap();
        assert_eq!(account.balance(), dec!(100));
    }

    #[tokio::test]
    async fn test_unavailable_store_refuses_transactions() {
        let store = store_with(&["A"]).await;
        store.set_available(false);
        assert!(matches!(
            store.begin().await,
            Err(StoreError::Unavailable { .. })
        ));

        store.set_available(true);
        assert!(store.begin().await.is_ok());
    }

    #[tokio::test]
    async fn test_accrual_run_recorded_once() {
        let store = store_with(&[]).await;
        let run = AccrualJobRun {
            period: 3,
            rate: dec!(0.01),
            accounts_touched: 0,
            total_interest: dec!(0),
            run_at: Utc::now(),
        };

        let mut tx = store.begin().await.unwrap();
        assert!(tx.record_accrual_run(&run).await.unwrap());
        tx.commit().await.unwrap();

        let mut tx = store.begin().await.unwrap();
        assert!(!tx.record_accrual_run(&run).await.unwrap());
        assert_eq!(store.accrual_run(3).await.unwrap(), Some(run));
    }
}
