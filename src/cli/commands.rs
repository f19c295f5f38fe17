//! Command implementations
//!
//! Each command builds the ledger over the configured backend, optionally
//! seeds accounts, does its work and writes CSV to the given output.

use super::args::{CliArgs, Command};
use crate::accrual::{AccrualError, AccrualOutcome, AccrualScheduler};
use crate::config::{AppConfig, ConfigError, StorageBackend};
use crate::core::{BatchProcessor, LedgerEngine};
use crate::history::HistoryQueryService;
use crate::io::{read_accounts, write_balances_csv, write_history_csv, OperationReader};
use crate::storage::{MemoryStore, PgStore, StorageGateway, StoreError};
use crate::types::{AccountId, LedgerError, TimeWindow};
use chrono::{DateTime, Utc};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Accrual(#[from] AccrualError),

    #[error("{0}")]
    Input(String),
}

/// Totals of one `apply` run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplySummary {
    pub applied: usize,
    pub replayed: usize,
    pub failed: usize,
}

/// Run the parsed command against the backend named in `config`
pub async fn run(args: CliArgs, config: AppConfig, output: &mut dyn Write) -> Result<(), CliError> {
    match config.storage.backend {
        StorageBackend::Memory => {
            let store = Arc::new(MemoryStore::with_lock_timeout(config.storage.lock_timeout()));
            Ledger::new(store, config).execute(args.command, output).await
        }
        StorageBackend::Postgres => {
            let url = config.storage.postgres_url.as_deref().ok_or_else(|| ConfigError::Invalid {
                message: "storage.postgres_url is required for the postgres backend".to_string(),
            })?;
            let store = PgStore::connect(
                url,
                config.storage.max_connections,
                config.storage.lock_timeout(),
            )
            .await?;
            store.migrate().await?;
            tracing::info!("Connected to PostgreSQL");
            Ledger::new(Arc::new(store), config).execute(args.command, output).await
        }
    }
}

/// The ledger components wired over one store
pub struct Ledger<S> {
    engine: LedgerEngine<S>,
    config: AppConfig,
}

impl<S: StorageGateway> Ledger<S> {
    pub fn new(store: Arc<S>, config: AppConfig) -> Self {
        Self {
            engine: LedgerEngine::new(store, config.retry.policy()),
            config,
        }
    }

    pub fn engine(&self) -> &LedgerEngine<S> {
        &self.engine
    }

    pub async fn execute(&self, command: Command, output: &mut dyn Write) -> Result<(), CliError> {
        match command {
            Command::Apply {
                operations,
                accounts,
            } => {
                self.seed(accounts.as_deref()).await?;
                self.apply(&operations).await?;
                self.write_balances(output).await
            }
            Command::Accrue { accounts, at } => {
                self.seed(accounts.as_deref()).await?;
                self.accrue(at.unwrap_or_else(Utc::now)).await?;
                self.write_balances(output).await
            }
            Command::History {
                account,
                from,
                to,
                accounts,
                operations,
            } => {
                self.seed(accounts.as_deref()).await?;
                if let Some(operations) = operations {
                    self.apply(&operations).await?;
                }
                self.write_history(&AccountId::new(account), from, to, output)
                    .await
            }
            Command::Serve { accounts } => {
                self.seed(accounts.as_deref()).await?;
                let cancel = CancellationToken::new();
                let handle = self.scheduler()?.spawn(cancel.clone());

                if let Err(error) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %error, "Failed to listen for shutdown signal");
                }
                tracing::info!("Shutting down");
                cancel.cancel();
                if let Err(error) = handle.await {
                    tracing::error!(error = %error, "Accrual scheduler task failed");
                }
                Ok(())
            }
        }
    }

    /// Provision every account in the seed file that does not exist yet
    pub async fn seed(&self, path: Option<&Path>) -> Result<usize, CliError> {
        let Some(path) = path else {
            return Ok(0);
        };

        let registry = self.engine.registry();
        let mut provisioned = 0;
        for account in read_accounts(path).map_err(CliError::Input)? {
            if registry.exists(&account.id).await? {
                tracing::info!(account = %account.id, "Account already provisioned, skipping");
                continue;
            }
            registry.provision(account).await?;
            provisioned += 1;
        }
        Ok(provisioned)
    }

    /// Stream the operation file through the batch processor
    ///
    /// Failed operations are logged and counted; they never abort the run.
    pub async fn apply(&self, path: &Path) -> Result<ApplySummary, CliError> {
        let mut reader = OperationReader::open(path).map_err(CliError::Input)?;
        let processor =
            BatchProcessor::new(self.engine.clone(), self.config.processing.max_concurrent);
        let mut summary = ApplySummary::default();

        loop {
            let batch = reader.read_batch(self.config.processing.batch_size);
            if batch.is_empty() {
                break;
            }

            for processed in processor.process_batch(batch).await {
                match processed.result {
                    Ok(receipt) if receipt.replayed => summary.replayed += 1,
                    Ok(_) => summary.applied += 1,
                    Err(error) => {
                        summary.failed += 1;
                        tracing::warn!(
                            key = %error.key,
                            status = error.status_code(),
                            error = %error.source,
                            "Operation failed"
                        );
                    }
                }
            }
        }

        tracing::info!(
            applied = summary.applied,
            replayed = summary.replayed,
            failed = summary.failed,
            "Finished applying operations"
        );
        Ok(summary)
    }

    pub fn scheduler(&self) -> Result<AccrualScheduler<S>, CliError> {
        let accrual = &self.config.accrual;
        Ok(AccrualScheduler::new(
            self.engine.clone(),
            accrual.calendar()?,
            accrual.policy(),
            accrual.tick(),
        ))
    }

    pub async fn accrue(&self, at: DateTime<Utc>) -> Result<AccrualOutcome, CliError> {
        let outcome = self.scheduler()?.tick(at).await?;
        let run = outcome.run();
        match &outcome {
            AccrualOutcome::Completed(_) => tracing::info!(
                period = run.period,
                accounts = run.accounts_touched,
                total_interest = %run.total_interest,
                "Accrual completed"
            ),
            AccrualOutcome::AlreadyRecorded(_) => tracing::info!(
                period = run.period,
                run_at = %run.run_at,
                "Accrual period already recorded"
            ),
        }
        Ok(outcome)
    }

    async fn write_balances(&self, output: &mut dyn Write) -> Result<(), CliError> {
        let accounts = self.engine.store().list_accounts().await?;
        write_balances_csv(&accounts, output).map_err(CliError::Input)
    }

    async fn write_history(
        &self,
        account: &AccountId,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        output: &mut dyn Write,
    ) -> Result<(), CliError> {
        let history = HistoryQueryService::new(
            Arc::clone(self.engine.store()),
            Arc::clone(self.engine.registry()),
        )
        .with_page_sizes(
            self.config.history.page_size,
            self.config.history.max_page_size,
        );

        let entries = history
            .all_entries(account, TimeWindow::new(from, to))
            .await?;
        write_history_csv(&entries, output).map_err(CliError::Input)
    }
}
