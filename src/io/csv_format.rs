//! CSV format handling for operations, account seeds and output
//!
//! This module centralizes all CSV format concerns, providing:
//! - `OperationCsvRecord`: one requested operation per row
//!   (`type,from,to,amount,key`)
//! - `AccountCsvRecord`: one account to provision per row
//!   (`id,owner,currency,balance,allow_negative,interest_eligible`)
//! - Balance and history output serialization
//!
//! All functions are pure (no I/O beyond the given writer) for easy testing.

use crate::types::{
    Account, AccountId, HistoryEntry, IdempotencyKey, NewAccount, Operation, OperationKind,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::io::Write;
use std::str::FromStr;

/// Operation row
///
/// `from` is required for withdrawals and transfers, `to` for deposits and
/// transfers; the other column may be left empty.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct OperationCsvRecord {
    #[serde(rename = "type")]
    pub kind: String,
    pub from: Option<String>,
    pub to: Option<String>,
    pub amount: Option<String>,
    pub key: String,
}

/// Account seed row
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct AccountCsvRecord {
    pub id: String,
    pub owner: String,
    pub currency: String,
    pub balance: String,
    pub allow_negative: Option<bool>,
    pub interest_eligible: Option<bool>,
}

fn non_empty(field: Option<String>) -> Option<String> {
    field
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_decimal(raw: &str, what: &str, key: &str) -> Result<Decimal, String> {
    Decimal::from_str(raw.trim()).map_err(|_| format!("Invalid {what} '{raw}' for {key}"))
}

/// Convert an OperationCsvRecord to an Operation
///
/// Amount positivity is not checked here; the Ledger Engine rejects
/// non-positive amounts with its own error.
///
/// # Returns
///
/// * `Ok(Operation)` - Successfully converted record
/// * `Err(String)` - Unknown type, missing endpoint, missing key or bad amount
pub fn convert_operation_record(record: OperationCsvRecord) -> Result<Operation, String> {
    let key = record.key.trim();
    if key.is_empty() {
        return Err("Operation without an idempotency key".to_string());
    }

    let kind = OperationKind::from_str(&record.kind).map_err(|e| format!("{e} for {key}"))?;

    let amount = match non_empty(record.amount) {
        Some(raw) => parse_decimal(&raw, "amount", key)?,
        None => return Err(format!("{kind} {key} requires an amount")),
    };

    let endpoint = |field: Option<String>, role: &str| {
        non_empty(field)
            .map(AccountId::new)
            .ok_or_else(|| format!("{kind} {key} requires a '{role}' account"))
    };

    let key = IdempotencyKey::new(key);
    let operation = match kind {
        OperationKind::Deposit => Operation::deposit(endpoint(record.to, "to")?, amount, key),
        OperationKind::Withdrawal => {
            Operation::withdrawal(endpoint(record.from, "from")?, amount, key)
        }
        OperationKind::Transfer => Operation::transfer(
            endpoint(record.from, "from")?,
            endpoint(record.to, "to")?,
            amount,
            key,
        ),
    };

    Ok(operation)
}

/// Convert an AccountCsvRecord to a provisioning request
///
/// Missing flags default to no credit line and interest eligible.
pub fn convert_account_record(record: AccountCsvRecord) -> Result<NewAccount, String> {
    let id = record.id.trim();
    if id.is_empty() {
        return Err("Account without an id".to_string());
    }
    if record.currency.trim().is_empty() {
        return Err(format!("Account {id} has no currency"));
    }

    let balance = parse_decimal(&record.balance, "balance", id)?;
    let mut account = NewAccount::new(id, record.owner.trim(), &record.currency, balance);
    account.allows_negative = record.allow_negative.unwrap_or(false);
    account.interest_eligible = record.interest_eligible.unwrap_or(true);
    Ok(account)
}

/// Write account balances to CSV format
///
/// Writes columns: account, owner, currency, balance, version.
/// Accounts are sorted by id for deterministic output.
pub fn write_balances_csv(accounts: &[Account], output: &mut dyn Write) -> Result<(), String> {
    use csv::Writer;

    let mut writer = Writer::from_writer(output);

    writer
        .write_record(["account", "owner", "currency", "balance", "version"])
        .map_err(|e| format!("Failed to write CSV header: {}", e))?;

    let mut sorted = accounts.to_vec();
    sorted.sort_by(|a, b| a.id().cmp(b.id()));

    for account in sorted {
        writer
            .write_record(&[
                account.id().to_string(),
                account.facts.owner.clone(),
                account.facts.currency.to_string(),
                format!("{:.4}", account.balance()),
                account.state.version.to_string(),
            ])
            .map_err(|e| format!("Failed to write account record: {}", e))?;
    }

    writer
        .flush()
        .map_err(|e| format!("Failed to flush output: {}", e))?;

    Ok(())
}

/// Write history entries to CSV format, in the order given
pub fn write_history_csv(entries: &[HistoryEntry], output: &mut dyn Write) -> Result<(), String> {
    use csv::Writer;

    let mut writer = Writer::from_writer(output);

    writer
        .write_record([
            "seq",
            "account",
            "type",
            "counterparty",
            "amount",
            "balance_after",
            "key",
            "committed_at",
        ])
        .map_err(|e| format!("Failed to write CSV header: {}", e))?;

    for entry in entries {
        writer
            .write_record(&[
                entry.seq.to_string(),
                entry.account.to_string(),
                entry.kind.to_string(),
                entry
                    .counterparty
                    .as_ref()
                    .map(ToString::to_string)
                    .unwrap_or_default(),
                format!("{:.4}", entry.amount),
                format!("{:.4}", entry.balance_after),
                entry.key.to_string(),
                entry.committed_at.to_rfc3339(),
            ])
            .map_err(|e| format!("Failed to write history record: {}", e))?;
    }

    writer
        .flush()
        .map_err(|e| format!("Failed to flush output: {}", e))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Movement;
    use chrono::Utc;
    use rstest::rstest;
    use rust_decimal_macros::dec;

    fn record(kind: &str, from: &str, to: &str, amount: &str, key: &str) -> OperationCsvRecord {
        let field = |value: &str| (!value.is_empty()).then(|| value.to_string());
        OperationCsvRecord {
            kind: kind.to_string(),
            from: field(from),
            to: field(to),
            amount: field(amount),
            key: key.to_string(),
        }
    }

    #[rstest]
    #[case::deposit(
        record("deposit", "", "A", "10.50", "k1"),
        Movement::Deposit { to: "A".into() }
    )]
    #[case::withdrawal(
        record("withdrawal", "A", "", "1", "k2"),
        Movement::Withdrawal { from: "A".into() }
    )]
    #[case::transfer(
        record("TRANSFER", "A", "B", "3", "k3"),
        Movement::Transfer { from: "A".into(), to: "B".into() }
    )]
    #[case::ignores_unused_endpoint(
        record("deposit", "X", "A", "1", "k4"),
        Movement::Deposit { to: "A".into() }
    )]
    fn test_convert_operation_record(
        #[case] record: OperationCsvRecord,
        #[case] expected: Movement,
    ) {
        let operation = convert_operation_record(record).unwrap();
        assert_eq!(operation.movement, expected);
    }

    #[rstest]
    #[case::unknown_type(record("dispute", "A", "", "1", "k"), "Invalid operation type")]
    #[case::missing_amount(record("deposit", "", "A", "", "k"), "requires an amount")]
    #[case::bad_amount(record("deposit", "", "A", "ten", "k"), "Invalid amount 'ten'")]
    #[case::missing_to(record("deposit", "A", "", "1", "k"), "requires a 'to' account")]
    #[case::missing_from(record("transfer", "", "B", "1", "k"), "requires a 'from' account")]
    #[case::missing_key(record("deposit", "", "A", "1", " "), "without an idempotency key")]
    fn test_convert_operation_record_errors(
        #[case] record: OperationCsvRecord,
        #[case] message: &str,
    ) {
        let error = convert_operation_record(record).unwrap_err();
        assert!(error.contains(message), "unexpected error: {error}");
    }

    #[test]
    fn test_negative_amount_is_left_to_the_engine() {
        let operation = convert_operation_record(record("deposit", "", "A", "-1", "k")).unwrap();
        assert_eq!(operation.amount, dec!(-1));
    }

    #[test]
    fn test_convert_account_record() {
        let account = convert_account_record(AccountCsvRecord {
            id: "A".to_string(),
            owner: "alice".to_string(),
            currency: "usd".to_string(),
            balance: "100.00".to_string(),
            allow_negative: Some(true),
            interest_eligible: None,
        })
        .unwrap();

        assert_eq!(account.currency.as_str(), "USD");
        assert_eq!(account.opening_balance, dec!(100.00));
        assert!(account.allows_negative);
        assert!(account.interest_eligible);
    }

    #[test]
    fn test_convert_account_record_rejects_bad_balance() {
        let result = convert_account_record(AccountCsvRecord {
            id: "A".to_string(),
            owner: "alice".to_string(),
            currency: "USD".to_string(),
            balance: "lots".to_string(),
            allow_negative: None,
            interest_eligible: None,
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_write_balances_csv_sorted() {
        let accounts = vec![
            NewAccount::new("B", "bob", "USD", dec!(80)).into_account(Utc::now()),
            NewAccount::new("A", "alice", "USD", dec!(70.5)).into_account(Utc::now()),
        ];

        let mut output = Vec::new();
        write_balances_csv(&accounts, &mut output).unwrap();

        let text = String::from_utf8(output).unwrap();
        assert_eq!(
            text,
            "account,owner,currency,balance,version\nA,alice,USD,70.5000,0\nB,bob,USD,80.0000,0\n"
        );
    }

    #[test]
    fn test_write_history_csv() {
        let entry = HistoryEntry {
            seq: 7,
            account: "A".into(),
            kind: OperationKind::Transfer,
            counterparty: Some("B".into()),
            amount: dec!(-30),
            balance_after: dec!(70),
            key: "t-1".into(),
            committed_at: Utc::now(),
        };

        let mut output = Vec::new();
        write_history_csv(&[entry], &mut output).unwrap();

        let text = String::from_utf8(output).unwrap();
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("seq,account,type,counterparty,amount,balance_after,key,committed_at")
        );
        assert!(lines
            .next()
            .unwrap()
            .starts_with("7,A,transfer,B,-30.0000,70.0000,t-1,"));
    }
}
