//! Batch application of operation requests
//!
//! The `BatchProcessor` applies a batch of operations with bounded
//! concurrency while keeping the outcome identical to applying them one by
//! one in input order.
//!
//! # Design
//!
//! The batch is cut into consecutive waves. A wave grows until the next
//! operation touches an account already used by the wave; that operation
//! opens a new wave. Operations inside a wave touch disjoint accounts and run
//! concurrently; waves run one after the other. Per-account ordering is thus
//! the input order, which matters for e.g. a withdrawal that depends on an
//! earlier deposit.

use std::collections::HashSet;

use super::engine::{LedgerEngine, Receipt};
use crate::storage::StorageGateway;
use crate::types::{AccountId, Operation, OperationError};
use futures::stream::{self, StreamExt};

/// Outcome of one operation of a batch
#[derive(Debug, Clone)]
pub struct ProcessingResult {
    /// The operation that was applied
    pub operation: Operation,

    /// Receipt, or the failure tagged with the idempotency key
    pub result: Result<Receipt, OperationError>,
}

/// Applies batches of operations through a shared [`LedgerEngine`]
#[derive(Debug, Clone)]
pub struct BatchProcessor<S> {
    engine: LedgerEngine<S>,

    /// Upper bound on operations in flight at once
    max_concurrent: usize,
}

impl<S: StorageGateway> BatchProcessor<S> {
    /// Create a new BatchProcessor
    ///
    /// # Arguments
    ///
    /// * `engine` - Engine every operation goes through
    /// * `max_concurrent` - Operations in flight at once (0 is treated as 1)
    pub fn new(engine: LedgerEngine<S>, max_concurrent: usize) -> Self {
        Self {
            engine,
            max_concurrent: max_concurrent.max(1),
        }
    }

    pub fn engine(&self) -> &LedgerEngine<S> {
        &self.engine
    }

    /// Split `batch` into waves of operations with disjoint account sets
    ///
    /// # Guarantees
    ///
    /// - Every operation appears in exactly one wave, in input order
    /// - No two operations in a wave touch the same account
    pub fn partition_into_waves(batch: Vec<Operation>) -> Vec<Vec<Operation>> {
        let mut waves: Vec<Vec<Operation>> = Vec::new();
        let mut current: Vec<Operation> = Vec::new();
        let mut touched: HashSet<AccountId> = HashSet::new();

        for operation in batch {
            let accounts = operation.movement.accounts();
            if accounts.iter().any(|id| touched.contains(*id)) {
                waves.push(std::mem::take(&mut current));
                touched.clear();
            }
            touched.extend(accounts.into_iter().cloned());
            current.push(operation);
        }

        if !current.is_empty() {
            waves.push(current);
        }
        waves
    }

    /// Apply every operation of `batch`
    ///
    /// Failures are captured per operation and never stop the batch.
    ///
    /// # Returns
    ///
    /// One `ProcessingResult` per operation, in input order.
    pub async fn process_batch(&self, batch: Vec<Operation>) -> Vec<ProcessingResult> {
        let mut results = Vec::with_capacity(batch.len());

        for wave in Self::partition_into_waves(batch) {
            tracing::trace!(size = wave.len(), "Applying wave");
            let applied: Vec<ProcessingResult> = stream::iter(wave)
                .map(|operation| async move {
                    let result = self.engine.execute(operation.clone()).await;
                    ProcessingResult { operation, result }
                })
                .buffered(self.max_concurrent)
                .collect()
                .await;
            results.extend(applied);
        }

        let failed = results.iter().filter(|r| r.result.is_err()).count();
        tracing::debug!(total = results.len(), failed, "Batch applied");
        results
    }
}
