use super::{AccrualCalendar, AccrualError, AccrualOutcome, AccrualPeriod, AccrualPolicy};
use crate::core::LedgerEngine;
use crate::storage::{with_transaction, StorageGateway, StoreTransaction};
use crate::types::{
    AccountId, AccrualJobRun, HistoryEntry, IdempotencyKey, LedgerError, Operation,
    OperationError, PeriodIndex, ACCRUAL_KEY_PREFIX,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Idempotency key of the interest deposit for `account` in `period`
///
/// Keys in this namespace are refused for client operations.
pub fn accrual_key(period: PeriodIndex, account: &AccountId) -> IdempotencyKey {
    IdempotencyKey::new(format!("{ACCRUAL_KEY_PREFIX}{period}:{account}"))
}

fn add_interest(
    total: Decimal,
    entries: &[HistoryEntry],
    account: &AccountId,
) -> Result<Decimal, LedgerError> {
    entries.iter().try_fold(total, |sum, entry| {
        sum.checked_add(entry.amount)
            .ok_or_else(|| LedgerError::arithmetic_overflow(account))
    })
}

/// Periodically credits interest through the Ledger Engine
#[derive(Debug, Clone)]
pub struct AccrualScheduler<S> {
    engine: LedgerEngine<S>,
    calendar: AccrualCalendar,
    policy: AccrualPolicy,
    tick_every: Duration,
}

impl<S: StorageGateway> AccrualScheduler<S> {
    pub fn new(
        engine: LedgerEngine<S>,
        calendar: AccrualCalendar,
        policy: AccrualPolicy,
        tick_every: Duration,
    ) -> Self {
        Self {
            engine,
            calendar,
            policy,
            tick_every,
        }
    }

    pub fn calendar(&self) -> &AccrualCalendar {
        &self.calendar
    }

    /// Accrue the period containing `now`
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<AccrualOutcome, AccrualError> {
        self.run_period(self.calendar.period_at(now)).await
    }

    /// Credit interest for `period` to every eligible account, at most once
    ///
    /// The run record is written only after every eligible account is
    /// credited. A failed run leaves no record and can simply be run again:
    /// accounts credited by the earlier attempt are recognised by their
    /// idempotency keys and counted, not credited twice.
    pub async fn run_period(&self, period: AccrualPeriod) -> Result<AccrualOutcome, AccrualError> {
        let store = self.engine.store();

        if let Some(run) = store.accrual_run(period.index).await.map_err(LedgerError::from)? {
            tracing::debug!(period = period.index, "Accrual period already recorded");
            return Ok(AccrualOutcome::AlreadyRecorded(run));
        }

        let accounts = store.list_accounts().await.map_err(LedgerError::from)?;
        let mut credited: u64 = 0;
        let mut total_interest = Decimal::ZERO;
        let mut failed: Vec<OperationError> = Vec::new();

        for account in accounts.iter().filter(|a| a.facts.interest_eligible) {
            let key = accrual_key(period.index, account.id());

            // An earlier attempt may have credited this account already; its
            // balance now includes the interest, so look the key up first.
            let earlier = Operation::deposit(account.id().clone(), Decimal::ONE, key.clone());
            if let Some(entries) = store
                .committed_operation(&earlier.scope())
                .await
                .map_err(LedgerError::from)?
            {
                credited += 1;
                total_interest = add_interest(total_interest, &entries, account.id())?;
                continue;
            }

            let Some(interest) = self.policy.interest_on(account.balance()) else {
                continue;
            };

            let credit = self
                .engine
                .credit_interest(account.id().clone(), interest, key)
                .await;
            match credit {
                Ok(receipt) => {
                    credited += 1;
                    total_interest =
                        add_interest(total_interest, &receipt.entries, account.id())?;
                }
                Err(error) => {
                    tracing::warn!(
                        period = period.index,
                        error = %error,
                        "Interest deposit failed"
                    );
                    failed.push(error);
                }
            }
        }

        if !failed.is_empty() {
            return Err(AccrualError::Incomplete {
                period: period.index,
                credited,
                failed,
            });
        }

        let run = AccrualJobRun {
            period: period.index,
            rate: self.policy.rate_per_period,
            accounts_touched: credited,
            total_interest,
            run_at: Utc::now(),
        };

        let record = run.clone();
        let recorded: Result<bool, LedgerError> = with_transaction(store.as_ref(), move |tx| {
            Box::pin(async move { Ok(tx.record_accrual_run(&record).await?) })
        })
        .await;

        match recorded {
            Ok(true) => {
                tracing::info!(
                    period = period.index,
                    accounts = run.accounts_touched,
                    total_interest = %run.total_interest,
                    "Accrual run recorded"
                );
                Ok(AccrualOutcome::Completed(run))
            }
            // Lost the race against a concurrent run of the same period
            Ok(false) => match store
                .accrual_run(period.index)
                .await
                .map_err(LedgerError::from)?
            {
                Some(existing) => Ok(AccrualOutcome::AlreadyRecorded(existing)),
                None => Err(LedgerError::persistence_failure(
                    "accrual run neither recorded nor found",
                )
                .into()),
            },
            // A concurrent run may have committed its record first
            Err(error) => {
                tracing::warn!(
                    period = period.index,
                    error = %error,
                    "Recording accrual run failed"
                );
                match store.accrual_run(period.index).await {
                    Ok(Some(existing)) => Ok(AccrualOutcome::AlreadyRecorded(existing)),
                    Ok(None) => Err(error.into()),
                    Err(lookup) => {
                        tracing::warn!(
                            period = period.index,
                            error = %lookup,
                            "Re-reading accrual run failed"
                        );
                        Err(error.into())
                    }
                }
            }
        }
    }

    /// Run [`tick`](Self::tick) on a fixed interval until `cancel` fires
    ///
    /// Tick failures are logged; the next tick retries the period.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.tick_every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tracing::info!(
                every_ms = self.tick_every.as_millis() as u64,
                "Accrual scheduler started"
            );

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        match self.tick(Utc::now()).await {
                            Ok(_) => {}
                            Err(error) => tracing::warn!(error = %error, "Accrual tick failed"),
                        }
                    }
                }
            }

            tracing::info!("Accrual scheduler stopped");
        })
    }
}
