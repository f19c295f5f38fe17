//! Streaming CSV readers
//!
//! Operations are streamed row by row so large inputs never sit in memory
//! all at once; [`OperationReader::read_batch`] hands them to the batch
//! processor a chunk at a time. Account seeds are small and read in one go.
//!
//! # Error Handling
//!
//! - Fatal errors (file not found, I/O errors) are returned from `open()`
//! - Individual row errors are yielded as `Err` items with their line number

use crate::io::csv_format::{
    convert_account_record, convert_operation_record, AccountCsvRecord, OperationCsvRecord,
};
use crate::types::{NewAccount, Operation};
use csv::{DeserializeRecordsIntoIter, ReaderBuilder, Trim};
use std::fs::File;
use std::io::Read;
use std::path::Path;

fn builder() -> ReaderBuilder {
    let mut builder = ReaderBuilder::new();
    builder
        .trim(Trim::All)
        .flexible(true)
        .buffer_capacity(8 * 1024);
    builder
}

/// Streaming reader over operation rows
pub struct OperationReader<R: Read = File> {
    records: DeserializeRecordsIntoIter<R, OperationCsvRecord>,

    /// Data rows consumed so far (the header is line 1)
    line_num: usize,
}

impl<R: Read> std::fmt::Debug for OperationReader<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationReader")
            .field("line_num", &self.line_num)
            .finish_non_exhaustive()
    }
}

impl OperationReader<File> {
    /// Open the operation CSV at `path`
    ///
    /// # Returns
    ///
    /// * `Ok(OperationReader)` if the file opened successfully
    /// * `Err(String)` if it could not be opened
    pub fn open(path: &Path) -> Result<Self, String> {
        let file = File::open(path)
            .map_err(|e| format!("Failed to open file '{}': {}", path.display(), e))?;
        Ok(Self::from_reader(file))
    }
}

impl<R: Read> OperationReader<R> {
    pub fn from_reader(reader: R) -> Self {
        Self {
            records: builder().from_reader(reader).into_deserialize(),
            line_num: 0,
        }
    }

    /// Read up to `batch_size` valid operations
    ///
    /// Invalid rows are logged and skipped. Returns an empty vector once the
    /// input is exhausted.
    pub fn read_batch(&mut self, batch_size: usize) -> Vec<Operation> {
        let mut batch = Vec::with_capacity(batch_size);
        while batch.len() < batch_size {
            match self.next() {
                Some(Ok(operation)) => batch.push(operation),
                Some(Err(error)) => tracing::warn!(error = %error, "Skipping operation row"),
                None => break,
            }
        }
        batch
    }
}

impl<R: Read> Iterator for OperationReader<R> {
    type Item = Result<Operation, String>;

    fn next(&mut self) -> Option<Self::Item> {
        let row = self.records.next()?;
        self.line_num += 1;
        let line = self.line_num + 1;

        Some(match row {
            Ok(record) => convert_operation_record(record).map_err(|e| format!("Line {line}: {e}")),
            Err(e) => Err(format!("Line {line}: CSV parse error: {e}")),
        })
    }
}

/// Read every account seed row at `path`
///
/// Unlike operations, a bad seed row is fatal: applying operations against
/// a partially seeded ledger would produce misleading balances.
pub fn read_accounts(path: &Path) -> Result<Vec<NewAccount>, String> {
    let file = File::open(path)
        .map_err(|e| format!("Failed to open file '{}': {}", path.display(), e))?;
    read_accounts_from(file)
}

pub fn read_accounts_from<R: Read>(reader: R) -> Result<Vec<NewAccount>, String> {
    builder()
        .from_reader(reader)
        .into_deserialize::<AccountCsvRecord>()
        .enumerate()
        .map(|(index, row)| {
            let line = index + 2;
            row.map_err(|e| format!("Line {line}: CSV parse error: {e}"))
                .and_then(|record| {
                    convert_account_record(record).map_err(|e| format!("Line {line}: {e}"))
                })
        })
        .collect()
}
