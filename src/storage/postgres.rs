//! PostgreSQL storage backend
//!
//! Transactions run at READ COMMITTED with a bounded `lock_timeout`. Row
//! locks are taken with `SELECT ... FOR UPDATE`, one statement per account in
//! lock order, so the database acquires them in exactly that order. A
//! `FOR UPDATE` that waited on another writer returns the row as that writer
//! committed it, so a queued operation proceeds on fresh balances instead of
//! failing with a serialization error.
//!
//! The single `ledger_sequence` row is locked last, after every account row,
//! and held until commit. Sequence numbers are therefore handed out in commit
//! order and no lock cycle can include it.
//!
//! SQLSTATEs that mean "try again" are mapped to [`StoreError::Conflict`]:
//! `40001` serialization failure, `40P01` deadlock, `55P03` lock timeout and
//! `23505` unique violation (a concurrent commit of the same idempotency
//! scope or accrual period).

use super::{schema, LockOrder, StorageGateway, StoreError, StoreTransaction};
use crate::types::{
    Account, AccountFacts, AccountId, AccountState, AccrualJobRun, Currency, HistoryEntry,
    HistoryLeg, IdempotencyKey, IdempotencyScope, NewAccount, OperationKind, PeriodIndex,
    SequenceNumber, TimeWindow,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::{Postgres, Row, Transaction};
use std::time::Duration;

const RETRYABLE_SQLSTATES: [&str; 4] = ["40001", "40P01", "55P03", "23505"];
const UNIQUE_VIOLATION: &str = "23505";

const ACCOUNT_COLUMNS: &str =
    "id, owner, currency, balance, version, allows_negative, interest_eligible, created_at";
const HISTORY_COLUMNS: &str =
    "seq, account_id, kind, counterparty, amount, balance_after, idempotency_key, committed_at";

/// PostgreSQL-backed storage gateway
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgStore {
    pub async fn connect(
        url: &str,
        max_connections: u32,
        lock_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(map_sqlx_error)?;
        Ok(Self::from_pool(pool, lock_timeout))
    }

    pub fn from_pool(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        schema::migrate(&self.pool).await
    }

    async fn connection(&self) -> Result<sqlx::pool::PoolConnection<Postgres>, StoreError> {
        self.pool.acquire().await.map_err(map_sqlx_error)
    }
}

fn map_sqlx_error(error: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &error {
        if let Some(code) = db.code() {
            if RETRYABLE_SQLSTATES.contains(&&*code) {
                return StoreError::conflict(format!("{} (SQLSTATE {code})", db.message()));
            }
        }
    }
    StoreError::unavailable(error.to_string())
}

fn is_unique_violation(error: &sqlx::Error) -> bool {
    matches!(error, sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION))
}

fn column<'r, T>(row: &'r PgRow, name: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name).map_err(map_sqlx_error)
}

fn to_unsigned(value: i64, what: &str) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::protocol(format!("negative {what} {value}")))
}

fn to_signed(value: u64, what: &str) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::protocol(format!("{what} {value} out of range")))
}

fn account_from_row(row: &PgRow) -> Result<Account, StoreError> {
    Ok(Account {
        facts: AccountFacts {
            id: AccountId::new(column::<String>(row, "id")?),
            owner: column(row, "owner")?,
            currency: Currency::new(column::<String>(row, "currency")?),
            allows_negative: column(row, "allows_negative")?,
            interest_eligible: column(row, "interest_eligible")?,
            created_at: column(row, "created_at")?,
        },
        state: AccountState {
            balance: column(row, "balance")?,
            version: to_unsigned(column(row, "version")?, "version")?,
        },
    })
}

fn entry_from_row(row: &PgRow) -> Result<HistoryEntry, StoreError> {
    let kind: String = column(row, "kind")?;
    Ok(HistoryEntry {
        seq: to_unsigned(column(row, "seq")?, "sequence number")?,
        account: AccountId::new(column::<String>(row, "account_id")?),
        kind: kind.parse::<OperationKind>().map_err(StoreError::protocol)?,
        counterparty: column::<Option<String>>(row, "counterparty")?.map(AccountId::new),
        amount: column(row, "amount")?,
        balance_after: column(row, "balance_after")?,
        key: IdempotencyKey::new(column::<String>(row, "idempotency_key")?),
        committed_at: column(row, "committed_at")?,
    })
}

fn accrual_run_from_row(row: &PgRow) -> Result<AccrualJobRun, StoreError> {
    Ok(AccrualJobRun {
        period: column(row, "period")?,
        rate: column(row, "rate")?,
        accounts_touched: to_unsigned(column(row, "accounts_touched")?, "account count")?,
        total_interest: column(row, "total_interest")?,
        run_at: column(row, "run_at")?,
    })
}

async fn load_operation(
    conn: &mut PgConnection,
    scope: &IdempotencyScope,
) -> Result<Option<Vec<HistoryEntry>>, StoreError> {
    let bounds =
        sqlx::query("SELECT first_seq, last_seq FROM committed_operations WHERE scope = $1")
            .bind(scope.storage_key())
            .fetch_optional(&mut *conn)
            .await
            .map_err(map_sqlx_error)?;

    let Some(bounds) = bounds else {
        return Ok(None);
    };
    let first: i64 = column(&bounds, "first_seq")?;
    let last: i64 = column(&bounds, "last_seq")?;

    let rows = sqlx::query(&format!(
        "SELECT {HISTORY_COLUMNS} FROM history WHERE seq BETWEEN $1 AND $2 ORDER BY seq"
    ))
    .bind(first)
    .bind(last)
    .fetch_all(&mut *conn)
    .await
    .map_err(map_sqlx_error)?;

    rows.iter()
        .map(entry_from_row)
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

#[async_trait]
impl StorageGateway for PgStore {
    type Tx = PgTransaction;

    async fn begin(&self) -> Result<PgTransaction, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL READ COMMITTED")
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        // SET does not take bind parameters; the value is an integer we format ourselves
        sqlx::query(&format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.lock_timeout.as_millis().max(1)
        ))
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        Ok(PgTransaction {
            tx,
            locked: Vec::new(),
            next_seq: None,
        })
    }

    async fn create_account(&self, account: NewAccount) -> Result<Account, StoreError> {
        let created_at = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO accounts (
                id, owner, currency, balance, version,
                allows_negative, interest_eligible, created_at
            )
            VALUES
                ($1, $2, $3, $4, 0, $5, $6, $7)
            "#,
        )
        .bind(account.id.as_str())
        .bind(&account.owner)
        .bind(account.currency.as_str())
        .bind(account.opening_balance)
        .bind(account.allows_negative)
        .bind(account.interest_eligible)
        .bind(created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(account.into_account(created_at)),
            Err(e) if is_unique_violation(&e) => Err(StoreError::DuplicateAccount {
                account: account.id,
            }),
            Err(e) => Err(map_sqlx_error(e)),
        }
    }

    async fn account(&self, id: &AccountId) -> Result<Option<Account>, StoreError> {
        let row = sqlx::query(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"))
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn list_accounts(&self) -> Result<Vec<Account>, StoreError> {
        let rows = sqlx::query(&format!("SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY id"))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter().map(account_from_row).collect()
    }

    async fn committed_operation(
        &self,
        scope: &IdempotencyScope,
    ) -> Result<Option<Vec<HistoryEntry>>, StoreError> {
        let mut conn = self.connection().await?;
        load_operation(&mut conn, scope).await
    }

    async fn history(
        &self,
        account: &AccountId,
        window: TimeWindow,
        after: Option<SequenceNumber>,
        limit: usize,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let after = to_signed(after.unwrap_or(0), "sequence number")?;
        let limit = to_signed(limit as u64, "page size")?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {HISTORY_COLUMNS} FROM history
            WHERE account_id = $1
              AND committed_at >= $2 AND committed_at < $3
              AND seq > $4
            ORDER BY seq
            LIMIT $5
            "#
        ))
        .bind(account.as_str())
        .bind(window.from)
        .bind(window.to)
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter().map(entry_from_row).collect()
    }

    async fn accrual_run(&self, period: PeriodIndex) -> Result<Option<AccrualJobRun>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT period, rate, accounts_touched, total_interest, run_at
            FROM accrual_runs
            WHERE period = $1
            "#,
        )
        .bind(period)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        row.as_ref().map(accrual_run_from_row).transpose()
    }
}

/// Open PostgreSQL transaction
///
/// Dropping it without committing rolls back (sqlx issues the ROLLBACK).
pub struct PgTransaction {
    tx: Transaction<'static, Postgres>,
    locked: Vec<AccountId>,

    /// Next sequence number while the counter row is locked by this transaction
    next_seq: Option<SequenceNumber>,
}

#[async_trait]
impl StoreTransaction for PgTransaction {
    async fn lock_accounts_for_update(
        &mut self,
        order: &LockOrder,
    ) -> Result<Vec<Account>, StoreError> {
        if !self.locked.is_empty() {
            return Err(StoreError::protocol(
                "accounts already locked in this transaction",
            ));
        }

        let mut accounts = Vec::with_capacity(order.len());
        for id in order.ids() {
            let row = sqlx::query(&format!(
                "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 FOR UPDATE"
            ))
            .bind(id.as_str())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?
            .ok_or_else(|| StoreError::MissingAccount {
                account: id.clone(),
            })?;

            accounts.push(account_from_row(&row)?);
            self.locked.push(id.clone());
        }

        Ok(accounts)
    }

    async fn committed_operation(
        &mut self,
        scope: &IdempotencyScope,
    ) -> Result<Option<Vec<HistoryEntry>>, StoreError> {
        load_operation(&mut self.tx, scope).await
    }

    async fn update_balance(
        &mut self,
        account: &AccountId,
        balance: Decimal,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        if !self.locked.contains(account) {
            return Err(StoreError::protocol(format!(
                "account {account} updated without a row lock"
            )));
        }

        let version: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE accounts SET balance = $1, version = version + 1
            WHERE id = $2 AND version = $3
            RETURNING version
            "#,
        )
        .bind(balance)
        .bind(account.as_str())
        .bind(to_signed(expected_version, "version")?)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;

        match version {
            Some(version) => to_unsigned(version, "version"),
            None => Err(StoreError::conflict(format!(
                "account {account} changed since it was locked"
            ))),
        }
    }

    async fn append_history(
        &mut self,
        scope: &IdempotencyScope,
        legs: Vec<HistoryLeg>,
    ) -> Result<Vec<HistoryEntry>, StoreError> {
        let mut next_seq = match self.next_seq {
            Some(next) => next,
            None => {
                let next: i64 = sqlx::query_scalar(
                    "SELECT next_seq FROM ledger_sequence WHERE id = 1 FOR UPDATE",
                )
                .fetch_one(&mut *self.tx)
                .await
                .map_err(map_sqlx_error)?;
                to_unsigned(next, "sequence number")?
            }
        };

        let committed_at: DateTime<Utc> = Utc::now();
        let mut entries = Vec::with_capacity(legs.len());
        for leg in legs {
            let entry = leg.sequenced(next_seq, scope.key.clone(), committed_at);
            next_seq += 1;

            sqlx::query(&format!(
                "INSERT INTO history ({HISTORY_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
            ))
            .bind(to_signed(entry.seq, "sequence number")?)
            .bind(entry.account.as_str())
            .bind(entry.kind.as_str())
            .bind(entry.counterparty.as_ref().map(AccountId::as_str))
            .bind(entry.amount)
            .bind(entry.balance_after)
            .bind(entry.key.as_str())
            .bind(entry.committed_at)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;

            entries.push(entry);
        }

        if let (Some(first), Some(last)) = (entries.first(), entries.last()) {
            sqlx::query(
                "INSERT INTO committed_operations (scope, first_seq, last_seq) VALUES ($1, $2, $3)",
            )
            .bind(scope.storage_key())
            .bind(to_signed(first.seq, "sequence number")?)
            .bind(to_signed(last.seq, "sequence number")?)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        }

        sqlx::query("UPDATE ledger_sequence SET next_seq = $1 WHERE id = 1")
            .bind(to_signed(next_seq, "sequence number")?)
            .execute(&mut *self.tx)
            .await
            .map_err(map_sqlx_error)?;
        self.next_seq = Some(next_seq);

        Ok(entries)
    }

    async fn record_accrual_run(&mut self, run: &AccrualJobRun) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO accrual_runs (period, rate, accounts_touched, total_interest, run_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (period) DO NOTHING
            "#,
        )
        .bind(run.period)
        .bind(run.rate)
        .bind(to_signed(run.accounts_touched, "account count")?)
        .bind(run.total_interest)
        .bind(run.run_at)
        .execute(&mut *self.tx)
        .await
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() == 1)
    }

    async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(map_sqlx_error)
    }

    async fn rollback(self) -> Result<(), StoreError> {
        self.tx.rollback().await.map_err(map_sqlx_error)
    }
}
