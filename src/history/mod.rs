//! History Query Service
//!
//! Read-only, paginated access to an account's committed history. Queries go
//! through the store's snapshot reads and never take a row lock, so they do
//! not interfere with the Ledger Engine's write path.
//!
//! Pages are ordered by sequence number ascending. A [`PageToken`] carries
//! the last sequence number of the previous page; because sequence numbers
//! are commit-ordered, walking the pages of a window that lies in the past
//! yields every entry of that window exactly once.

mod token;

pub use token::PageToken;

use crate::core::AccountRegistry;
use crate::storage::StorageGateway;
use crate::types::{AccountFacts, AccountId, HistoryEntry, LedgerError, TimeWindow};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;

pub const DEFAULT_PAGE_SIZE: usize = 100;
pub const DEFAULT_MAX_PAGE_SIZE: usize = 1_000;

/// One page of history
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryPage {
    pub entries: Vec<HistoryEntry>,

    /// Present when more entries follow in the same window
    pub next_page_token: Option<PageToken>,
}

/// Money received and withdrawn over a window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Turnover {
    /// Sum of credits
    pub received: Decimal,

    /// Sum of debits, as a positive number
    pub withdrawn: Decimal,
}

impl Turnover {
    pub fn net(&self) -> Decimal {
        self.received - self.withdrawn
    }

    fn add(&mut self, entry: &HistoryEntry) {
        if entry.is_debit() {
            self.withdrawn += entry.amount.abs();
        } else {
            self.received += entry.amount;
        }
    }
}

/// Everything the statement renderer needs for one account and window
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub account: AccountFacts,
    pub window: TimeWindow,
    pub entries: Vec<HistoryEntry>,
    pub turnover: Turnover,

    /// Balance before the first entry of the window (None without entries)
    pub opening_balance: Option<Decimal>,

    /// Balance after the last entry of the window (None without entries)
    pub closing_balance: Option<Decimal>,

    /// Balance at the time the statement was generated
    pub current_balance: Decimal,

    pub generated_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct HistoryQueryService<S> {
    store: Arc<S>,
    registry: Arc<AccountRegistry<S>>,
    page_size: usize,
    max_page_size: usize,
}

impl<S: StorageGateway> HistoryQueryService<S> {
    pub fn new(store: Arc<S>, registry: Arc<AccountRegistry<S>>) -> Self {
        Self {
            store,
            registry,
            page_size: DEFAULT_PAGE_SIZE,
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
        }
    }

    /// Override the default and maximum page sizes (both at least 1)
    pub fn with_page_sizes(mut self, page_size: usize, max_page_size: usize) -> Self {
        self.max_page_size = max_page_size.max(1);
        self.page_size = page_size.clamp(1, self.max_page_size);
        self
    }

    /// One page of `account`'s history inside `window`
    ///
    /// # Returns
    ///
    /// * `Ok(HistoryPage)` - Entries ascending by sequence number
    /// * `Err(LedgerError::AccountNotFound)` - If the account is unknown
    /// * `Err(LedgerError::InvalidPageToken)` - If `page_token` is malformed
    pub async fn history(
        &self,
        account: &AccountId,
        window: TimeWindow,
        page_token: Option<&PageToken>,
    ) -> Result<HistoryPage, LedgerError> {
        self.history_page(account, window, page_token, self.page_size)
            .await
    }

    /// Like [`history`](Self::history) with an explicit page size, capped at
    /// the configured maximum
    pub async fn history_page(
        &self,
        account: &AccountId,
        window: TimeWindow,
        page_token: Option<&PageToken>,
        page_size: usize,
    ) -> Result<HistoryPage, LedgerError> {
        self.registry.get(account).await?;
        let after = page_token.map(PageToken::decode).transpose()?;
        let page_size = page_size.clamp(1, self.max_page_size);

        if window.from >= window.to {
            return Ok(HistoryPage {
                entries: Vec::new(),
                next_page_token: None,
            });
        }

        // One extra row tells whether another page follows
        let mut entries = self
            .store
            .history(account, window, after, page_size + 1)
            .await?;

        let next_page_token = if entries.len() > page_size {
            entries.truncate(page_size);
            entries.last().map(|entry| PageToken::encode(entry.seq))
        } else {
            None
        };

        tracing::debug!(
            account = %account,
            returned = entries.len(),
            more = next_page_token.is_some(),
            "History page"
        );

        Ok(HistoryPage {
            entries,
            next_page_token,
        })
    }

    /// Every entry of `account` inside `window`, walking all pages
    pub async fn all_entries(
        &self,
        account: &AccountId,
        window: TimeWindow,
    ) -> Result<Vec<HistoryEntry>, LedgerError> {
        let mut entries = Vec::new();
        let mut token: Option<PageToken> = None;

        loop {
            let page = self.history(account, window, token.as_ref()).await?;
            entries.extend(page.entries);
            match page.next_page_token {
                Some(next) => token = Some(next),
                None => return Ok(entries),
            }
        }
    }

    /// Money received and withdrawn by `account` during `window`
    pub async fn turnover(
        &self,
        account: &AccountId,
        window: TimeWindow,
    ) -> Result<Turnover, LedgerError> {
        let entries = self.all_entries(account, window).await?;
        Ok(summarise(&entries))
    }

    /// Gather a complete statement for `account` over `window`
    pub async fn statement(
        &self,
        account: &AccountId,
        window: TimeWindow,
    ) -> Result<Statement, LedgerError> {
        let facts = self.registry.get(account).await?;
        let entries = self.all_entries(account, window).await?;
        let current = self
            .store
            .account(account)
            .await?
            .ok_or_else(|| LedgerError::account_not_found(account))?;

        Ok(Statement {
            account: facts,
            window,
            turnover: summarise(&entries),
            opening_balance: entries.first().map(|e| e.balance_after - e.amount),
            closing_balance: entries.last().map(|e| e.balance_after),
            current_balance: current.balance(),
            generated_at: Utc::now(),
            entries,
        })
    }
}

fn summarise(entries: &[HistoryEntry]) -> Turnover {
    let mut turnover = Turnover::default();
    for entry in entries {
        turnover.add(entry);
    }
    turnover
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{LedgerEngine, RetryPolicy};
    use crate::storage::MemoryStore;
    use crate::types::NewAccount;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    async fn setup() -> (LedgerEngine<MemoryStore>, HistoryQueryService<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        for (id, balance) in [("A", dec!(100.00)), ("B", dec!(50.00))] {
            store
                .create_account(NewAccount::new(id, "owner", "USD", balance))
                .await
                .unwrap();
        }
        let engine = LedgerEngine::new(Arc::clone(&store), RetryPolicy::default());
        let service = HistoryQueryService::new(store, Arc::clone(engine.registry()))
            .with_page_sizes(2, 10);
        (engine, service)
    }

    fn around_now() -> TimeWindow {
        let now = Utc::now();
        TimeWindow::new(now - Duration::hours(1), now + Duration::hours(1))
    }

    async fn five_operations(engine: &LedgerEngine<MemoryStore>) {
        engine.deposit("A", dec!(10), "d1").await.unwrap();
        engine.transfer("A", "B", dec!(30), "t1").await.unwrap();
        engine.withdraw("A", dec!(5), "w1").await.unwrap();
        engine.deposit("B", dec!(1), "d2").await.unwrap();
        engine.transfer("B", "A", dec!(20), "t2").await.unwrap();
    }

    #[tokio::test]
    async fn test_pages_cover_window_in_sequence_order() {
        let (engine, service) = setup().await;
        five_operations(&engine).await;
        let account = AccountId::new("A");

        let first = service.history(&account, around_now(), None).await.unwrap();
        assert_eq!(first.entries.len(), 2);
        let token = first.next_page_token.clone().unwrap();

        let second = service
            .history(&account, around_now(), Some(&token))
            .await
            .unwrap();
        assert_eq!(second.entries.len(), 2);
        assert!(second.next_page_token.is_none());

        let seqs: Vec<u64> = first
            .entries
            .iter()
            .chain(second.entries.iter())
            .map(|e| e.seq)
            .collect();
        let mut sorted = seqs.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(seqs, sorted);

        let amounts: Vec<Decimal> = first
            .entries
            .iter()
            .chain(second.entries.iter())
            .map(|e| e.amount)
            .collect();
        assert_eq!(amounts, vec![dec!(10), dec!(-30), dec!(-5), dec!(20)]);
    }

    #[tokio::test]
    async fn test_window_excludes_other_times() {
        let (engine, service) = setup().await;
        five_operations(&engine).await;

        let past = Utc::now() - Duration::days(2);
        let window = TimeWindow::new(past, past + Duration::days(1));
        let page = service.history(&AccountId::new("A"), window, None).await.unwrap();
        assert!(page.entries.is_empty());

        let inverted = TimeWindow::new(Utc::now(), Utc::now() - Duration::hours(1));
        let page = service.history(&AccountId::new("A"), inverted, None).await.unwrap();
        assert!(page.entries.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_account() {
        let (_engine, service) = setup().await;
        let result = service.history(&AccountId::new("Z"), around_now(), None).await;
        assert_eq!(result, Err(LedgerError::account_not_found(&AccountId::new("Z"))));
    }

    #[tokio::test]
    async fn test_malformed_token() {
        let (_engine, service) = setup().await;
        let token = PageToken::from("not a token!");
        let result = service
            .history(&AccountId::new("A"), around_now(), Some(&token))
            .await;
        assert!(matches!(result, Err(LedgerError::InvalidPageToken { .. })));
    }

    #[tokio::test]
    async fn test_history_sums_to_balance_change() {
        let (engine, service) = setup().await;
        five_operations(&engine).await;

        for (id, opening) in [("A", dec!(100.00)), ("B", dec!(50.00))] {
            let account = AccountId::new(id);
            let entries = service.all_entries(&account, around_now()).await.unwrap();
            let sum: Decimal = entries.iter().map(|e| e.amount).sum();
            let current = engine.store().account(&account).await.unwrap().unwrap();
            assert_eq!(opening + sum, current.balance());
        }
    }

    #[tokio::test]
    async fn test_turnover_and_statement() {
        let (engine, service) = setup().await;
        five_operations(&engine).await;
        let account = AccountId::new("A");

        let turnover = service.turnover(&account, around_now()).await.unwrap();
        assert_eq!(turnover.received, dec!(30));
        assert_eq!(turnover.withdrawn, dec!(35));
        assert_eq!(turnover.net(), dec!(-5));

        let statement = service.statement(&account, around_now()).await.unwrap();
        assert_eq!(statement.entries.len(), 4);
        assert_eq!(statement.turnover, turnover);
        assert_eq!(statement.opening_balance, Some(dec!(100.00)));
        assert_eq!(statement.closing_balance, Some(dec!(95.00)));
        assert_eq!(statement.current_balance, dec!(95.00));
    }
}
