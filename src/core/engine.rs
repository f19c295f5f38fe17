//! Ledger Engine
//!
//! Validates and commits deposits, withdrawals and transfers as atomic units.
//! Every balance mutation in the system, scheduler-issued ones included, goes
//! through the same validate-lock-commit path. Client operations enter via
//! [`LedgerEngine::execute`]; interest credits enter via a crate-internal
//! entry point, the only one allowed keys in the accrual namespace.
//!
//! # Protocol
//!
//! 1. Reject reserved client keys, non-positive amounts and self transfers.
//! 2. Resolve every endpoint through the [`AccountRegistry`]; transfers must
//!    stay within one currency.
//! 3. Look the idempotency scope up in a snapshot; a hit is replayed without
//!    touching any lock.
//! 4. Build the [`LockOrder`] (sorted account ids).
//! 5. In one store transaction: lock, re-check the idempotency scope, re-read
//!    balances, check the credit-line invariant, write balances, append the
//!    history legs, commit.
//! 6. A store conflict re-runs step 5 under the [`RetryPolicy`].
//!
//! Step 5 runs in its own task: once an operation is Locked, dropping the
//! caller's future does not stop it from reaching Committed or Aborted.

use super::registry::AccountRegistry;
use super::retry::RetryPolicy;
use super::state::{Lifecycle, OperationState};
use crate::storage::{with_transaction, LockOrder, StorageGateway, StoreError, StoreTransaction};
use crate::types::{
    Account, AccountId, HistoryEntry, HistoryLeg, IdempotencyKey, LedgerError, Movement,
    Operation, OperationError, OperationKind,
};
use rust_decimal::Decimal;
use std::sync::Arc;

/// Result of a successful operation
#[derive(Debug, Clone, PartialEq)]
pub struct Receipt {
    pub operation: Operation,

    /// Committed legs: one for deposits and withdrawals, debit then credit
    /// for transfers
    pub entries: Vec<HistoryEntry>,

    /// True when the operation had already been committed under the same
    /// idempotency scope and `entries` are that earlier result
    pub replayed: bool,
}

impl Receipt {
    /// Balance of `account` right after this operation
    pub fn balance_after(&self, account: &AccountId) -> Option<Decimal> {
        self.entries
            .iter()
            .find(|entry| &entry.account == account)
            .map(|entry| entry.balance_after)
    }
}

/// Failure of one attempt at the Locked phase
#[derive(Debug)]
enum AttemptError {
    Conflict(String),
    Ledger(LedgerError),
}

impl From<StoreError> for AttemptError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::Conflict { reason } => AttemptError::Conflict(reason),
            other => AttemptError::Ledger(other.into()),
        }
    }
}

impl From<LedgerError> for AttemptError {
    fn from(error: LedgerError) -> Self {
        AttemptError::Ledger(error)
    }
}

struct Applied {
    entries: Vec<HistoryEntry>,
    replayed: bool,
}

/// Who submitted an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Client,

    /// The accrual scheduler, the only submitter allowed reserved keys
    Accrual,
}

/// The single write path of the ledger
///
/// Cheap to clone; clones share the store, registry and policy.
#[derive(Debug)]
pub struct LedgerEngine<S> {
    store: Arc<S>,
    registry: Arc<AccountRegistry<S>>,
    retry: RetryPolicy,
}

impl<S> Clone for LedgerEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            retry: self.retry,
        }
    }
}

impl<S: StorageGateway> LedgerEngine<S> {
    /// Create an engine over `store` with its own registry
    pub fn new(store: Arc<S>, retry: RetryPolicy) -> Self {
        let registry = Arc::new(AccountRegistry::new(Arc::clone(&store)));
        Self::with_registry(store, registry, retry)
    }

    /// Create an engine sharing an existing registry
    pub fn with_registry(
        store: Arc<S>,
        registry: Arc<AccountRegistry<S>>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            registry,
            retry,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<AccountRegistry<S>> {
        &self.registry
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Credit `amount` to `account`
    pub async fn deposit(
        &self,
        account: impl Into<AccountId>,
        amount: Decimal,
        key: impl Into<IdempotencyKey>,
    ) -> Result<Receipt, OperationError> {
        self.execute(Operation::deposit(account.into(), amount, key.into()))
            .await
    }

    /// Debit `amount` from `account`
    pub async fn withdraw(
        &self,
        account: impl Into<AccountId>,
        amount: Decimal,
        key: impl Into<IdempotencyKey>,
    ) -> Result<Receipt, OperationError> {
        self.execute(Operation::withdrawal(account.into(), amount, key.into()))
            .await
    }

    /// Move `amount` from `from` to `to` as one double-entry unit
    pub async fn transfer(
        &self,
        from: impl Into<AccountId>,
        to: impl Into<AccountId>,
        amount: Decimal,
        key: impl Into<IdempotencyKey>,
    ) -> Result<Receipt, OperationError> {
        self.execute(Operation::transfer(from.into(), to.into(), amount, key.into()))
            .await
    }

    /// Validate and commit `operation`
    ///
    /// # Returns
    ///
    /// * `Ok(Receipt)` - Committed now, or replayed from an earlier commit
    /// * `Err(OperationError)` - The failure, tagged with the idempotency key
    /// * `Err(OperationError)` with `ReservedKey` - If the key lies in the
    ///   interest-credit namespace
    pub async fn execute(&self, operation: Operation) -> Result<Receipt, OperationError> {
        self.submit(operation, Origin::Client).await
    }

    /// Credit interest to `account` under a key from the accrual namespace
    pub(crate) async fn credit_interest(
        &self,
        account: AccountId,
        amount: Decimal,
        key: IdempotencyKey,
    ) -> Result<Receipt, OperationError> {
        self.submit(Operation::deposit(account, amount, key), Origin::Accrual)
            .await
    }

    async fn submit(
        &self,
        operation: Operation,
        origin: Origin,
    ) -> Result<Receipt, OperationError> {
        let key = operation.key.clone();
        let mut lifecycle = Lifecycle::new(&key);

        if let Err(error) = self.validate(&operation, origin).await {
            tracing::debug!(key = %key, error = %error, "Operation rejected");
            lifecycle.advance(OperationState::Rejected);
            return Err(OperationError::new(&key, error));
        }
        lifecycle.advance(OperationState::Validated);

        match self.store.committed_operation(&operation.scope()).await {
            Ok(Some(entries)) => {
                lifecycle.replayed();
                tracing::info!(
                    key = %key,
                    kind = %operation.kind(),
                    "Replaying committed operation"
                );
                return Ok(Receipt {
                    operation,
                    entries,
                    replayed: true,
                });
            }
            Ok(None) => {}
            Err(error) => {
                lifecycle.advance(OperationState::Rejected);
                return Err(OperationError::new(&key, error.into()));
            }
        }

        let engine = self.clone();
        let locked = tokio::spawn(async move { engine.run_locked(operation, lifecycle).await });

        match locked.await {
            Ok(result) => result,
            Err(join_error) => Err(OperationError::new(
                &key,
                LedgerError::persistence_failure(format!("operation task failed: {join_error}")),
            )),
        }
    }

    async fn validate(&self, operation: &Operation, origin: Origin) -> Result<(), LedgerError> {
        if origin == Origin::Client && operation.key.is_reserved() {
            return Err(LedgerError::ReservedKey {
                key: operation.key.clone(),
            });
        }
        if operation.amount <= Decimal::ZERO {
            return Err(LedgerError::invalid_amount(operation.amount));
        }

        match &operation.movement {
            Movement::Deposit { to: account } | Movement::Withdrawal { from: account } => {
                self.registry.get(account).await?;
            }
            Movement::Transfer { from, to } => {
                if from == to {
                    return Err(LedgerError::SelfTransfer {
                        account: from.clone(),
                    });
                }

                let source = self.registry.get(from).await?;
                let destination = self.registry.get(to).await?;
                if source.currency != destination.currency {
                    return Err(LedgerError::currency_mismatch(
                        from,
                        &source.currency,
                        to,
                        &destination.currency,
                    ));
                }
            }
        }

        Ok(())
    }

    /// The Locked phase, with the bounded retry loop
    async fn run_locked(
        &self,
        operation: Operation,
        mut lifecycle: Lifecycle,
    ) -> Result<Receipt, OperationError> {
        let key = operation.key.clone();
        let order = LockOrder::new(operation.movement.accounts().into_iter().cloned());
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            lifecycle.advance(OperationState::Locked);

            let planned = operation.clone();
            let lock_order = order.clone();
            let result = with_transaction(self.store.as_ref(), move |tx| {
                Box::pin(apply_locked(tx, planned, lock_order))
            })
            .await;

            match result {
                Ok(applied) => {
                    lifecycle.advance(OperationState::Committed);
                    if applied.replayed {
                        tracing::info!(key = %key, "Operation committed concurrently; replaying");
                    } else {
                        tracing::info!(
                            key = %key,
                            kind = %operation.kind(),
                            amount = %operation.amount,
                            first_seq = applied.entries.first().map(|e| e.seq),
                            attempt,
                            "Operation committed"
                        );
                    }
                    return Ok(Receipt {
                        operation,
                        entries: applied.entries,
                        replayed: applied.replayed,
                    });
                }
                Err(AttemptError::Conflict(reason)) if self.retry.should_retry(attempt) => {
                    let delay = self.retry.delay_for_retry(attempt);
                    tracing::warn!(
                        key = %key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "Store conflict; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(AttemptError::Conflict(reason)) => {
                    lifecycle.advance(OperationState::Aborted);
                    tracing::error!(
                        key = %key,
                        attempts = attempt,
                        reason = %reason,
                        "Retry bound exhausted"
                    );
                    return Err(OperationError::new(
                        &key,
                        LedgerError::ConcurrentModificationExceeded { attempts: attempt },
                    ));
                }
                Err(AttemptError::Ledger(error)) => {
                    lifecycle.advance(OperationState::Aborted);
                    tracing::debug!(key = %key, error = %error, "Operation aborted");
                    return Err(OperationError::new(&key, error));
                }
            }
        }
    }
}

/// One attempt at the Locked phase inside an open transaction
async fn apply_locked<T: StoreTransaction>(
    tx: &mut T,
    operation: Operation,
    order: LockOrder,
) -> Result<Applied, AttemptError> {
    let rows = tx.lock_accounts_for_update(&order).await?;

    let scope = operation.scope();
    if let Some(entries) = tx.committed_operation(&scope).await? {
        return Ok(Applied {
            entries,
            replayed: true,
        });
    }

    let legs = plan_legs(&operation, &rows)?;
    let mut history = Vec::with_capacity(legs.len());
    for (leg, version) in legs {
        tx.update_balance(&leg.account, leg.balance_after, version)
            .await?;
        history.push(leg);
    }

    let entries = tx.append_history(&scope, history).await?;
    Ok(Applied {
        entries,
        replayed: false,
    })
}

/// Compute the history legs of `operation` against freshly locked rows
///
/// Returns each leg with the version its row was locked at.
fn plan_legs(
    operation: &Operation,
    rows: &[Account],
) -> Result<Vec<(HistoryLeg, u64)>, LedgerError> {
    let amount = operation.amount;
    let kind = operation.kind();

    match &operation.movement {
        Movement::Deposit { to } => {
            let row = locked_row(rows, to)?;
            Ok(vec![credit(row, kind, None, amount)?])
        }
        Movement::Withdrawal { from } => {
            let row = locked_row(rows, from)?;
            Ok(vec![debit(row, kind, None, amount)?])
        }
        Movement::Transfer { from, to } => {
            let source = locked_row(rows, from)?;
            let destination = locked_row(rows, to)?;
            Ok(vec![
                debit(source, kind, Some(to), amount)?,
                credit(destination, kind, Some(from), amount)?,
            ])
        }
    }
}

fn locked_row<'a>(rows: &'a [Account], id: &AccountId) -> Result<&'a Account, LedgerError> {
    rows.iter()
        .find(|row| row.id() == id)
        .ok_or_else(|| LedgerError::account_not_found(id))
}

fn debit(
    row: &Account,
    kind: OperationKind,
    counterparty: Option<&AccountId>,
    amount: Decimal,
) -> Result<(HistoryLeg, u64), LedgerError> {
    let balance = row.balance();
    let balance_after = balance
        .checked_sub(amount)
        .ok_or_else(|| LedgerError::arithmetic_overflow(row.id()))?;

    if !row.permits_balance(balance_after) {
        return Err(LedgerError::insufficient_funds(row.id(), balance, amount));
    }

    Ok(leg(row, kind, counterparty, -amount, balance_after))
}

fn credit(
    row: &Account,
    kind: OperationKind,
    counterparty: Option<&AccountId>,
    amount: Decimal,
) -> Result<(HistoryLeg, u64), LedgerError> {
    let balance_after = row
        .balance()
        .checked_add(amount)
        .ok_or_else(|| LedgerError::arithmetic_overflow(row.id()))?;

    Ok(leg(row, kind, counterparty, amount, balance_after))
}

fn leg(
    row: &Account,
    kind: OperationKind,
    counterparty: Option<&AccountId>,
    amount: Decimal,
    balance_after: Decimal,
) -> (HistoryLeg, u64) {
    let leg = HistoryLeg {
        account: row.id().clone(),
        kind,
        counterparty: counterparty.cloned(),
        amount,
        balance_after,
    };
    (leg, row.state.version)
}
