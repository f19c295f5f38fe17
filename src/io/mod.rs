//! I/O module
//!
//! Handles CSV parsing and output.
//!
//! # Components
//!
//! - `csv_format` - CSV format handling (record conversion, output serialization)
//! - `reader` - Streaming operation reader and account seed reader

pub mod csv_format;
pub mod reader;

pub use csv_format::{
    convert_account_record, convert_operation_record, write_balances_csv, write_history_csv,
    AccountCsvRecord, OperationCsvRecord,
};
pub use reader::{read_accounts, read_accounts_from, OperationReader};
