//! PostgreSQL schema for the ledger

use super::StoreError;
use sqlx::PgPool;

/// Accounts: immutable facts plus the mutable balance/version pair
pub const CREATE_ACCOUNTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id                TEXT PRIMARY KEY,
    owner             TEXT NOT NULL,
    currency          TEXT NOT NULL,
    balance           NUMERIC(38, 8) NOT NULL,
    version           BIGINT NOT NULL DEFAULT 0,
    allows_negative   BOOLEAN NOT NULL DEFAULT FALSE,
    interest_eligible BOOLEAN NOT NULL DEFAULT TRUE,
    created_at        TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

/// Append-only history legs
pub const CREATE_HISTORY_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS history (
    seq             BIGINT PRIMARY KEY,
    account_id      TEXT NOT NULL REFERENCES accounts(id),
    kind            TEXT NOT NULL,
    counterparty    TEXT,
    amount          NUMERIC(38, 8) NOT NULL,
    balance_after   NUMERIC(38, 8) NOT NULL,
    idempotency_key TEXT NOT NULL,
    committed_at    TIMESTAMPTZ NOT NULL
)
"#;

pub const CREATE_HISTORY_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS history_account_seq_idx ON history (account_id, seq)
"#;

/// Idempotency index: one row per committed operation scope
pub const CREATE_COMMITTED_OPERATIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS committed_operations (
    scope     TEXT PRIMARY KEY,
    first_seq BIGINT NOT NULL,
    last_seq  BIGINT NOT NULL
)
"#;

/// Single-row sequence counter; locking it serialises sequence allocation
/// in commit order and a rollback gives the numbers back
pub const CREATE_SEQUENCE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS ledger_sequence (
    id       SMALLINT PRIMARY KEY CHECK (id = 1),
    next_seq BIGINT NOT NULL
)
"#;

pub const SEED_SEQUENCE_ROW: &str = r#"
INSERT INTO ledger_sequence (id, next_seq) VALUES (1, 1) ON CONFLICT (id) DO NOTHING
"#;

pub const CREATE_ACCRUAL_RUNS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS accrual_runs (
    period           BIGINT PRIMARY KEY,
    rate             NUMERIC(38, 12) NOT NULL,
    accounts_touched BIGINT NOT NULL,
    total_interest   NUMERIC(38, 8) NOT NULL,
    run_at           TIMESTAMPTZ NOT NULL
)
"#;

/// Create every table the ledger needs (idempotent)
pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
    tracing::info!("Initializing ledger schema");

    for statement in [
        CREATE_ACCOUNTS_TABLE,
        CREATE_HISTORY_TABLE,
        CREATE_HISTORY_INDEX,
        CREATE_COMMITTED_OPERATIONS_TABLE,
        CREATE_SEQUENCE_TABLE,
        SEED_SEQUENCE_ROW,
        CREATE_ACCRUAL_RUNS_TABLE,
    ] {
        sqlx::query(statement)
            .execute(pool)
            .await
            .map_err(|e| StoreError::unavailable(format!("schema migration failed: {e}")))?;
    }

    Ok(())
}
