use std::collections::BTreeMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use pbalend_core::{Address, MarketKey, PositionKey};
use pbalend_events::EventPosition;
use pbalend_lending::{BorrowPosition, LendPosition, Market};

use super::store::{LedgerRow, LedgerStore, LedgerWrite, MarketPositions, StoreError};

#[derive(Debug, Default)]
struct Tables {
    markets: BTreeMap<MarketKey, Market>,
    lend: BTreeMap<PositionKey, LendPosition>,
    borrow: BTreeMap<PositionKey, BorrowPosition>,
    cursors: BTreeMap<MarketKey, EventPosition>,
}

/// In-memory ledger store for tests/dev.
///
/// All tables sit behind one lock, so a `commit` is atomic with respect to
/// every reader.
#[derive(Debug, Default)]
pub struct InMemoryLedgerStore {
    tables: RwLock<Tables>,
    failing_commits: AtomicU32,
}

impl InMemoryLedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with `StoreError::Unavailable`
    /// without writing anything.
    pub fn fail_next_commits(&self, n: u32) {
        self.failing_commits.store(n, Ordering::SeqCst);
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, StoreError> {
        self.tables
            .read()
            .map_err(|_| StoreError::Corrupt("in-memory ledger lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>, StoreError> {
        self.tables
            .write()
            .map_err(|_| StoreError::Corrupt("in-memory ledger lock poisoned".to_string()))
    }

    fn take_injected_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedgerStore {
    async fn get_market(&self, key: &MarketKey) -> Result<Option<Market>, StoreError> {
        Ok(self.read()?.markets.get(key).cloned())
    }

    async fn get_lend_position(&self, key: &PositionKey) -> Result<Option<LendPosition>, StoreError> {
        Ok(self.read()?.lend.get(key).cloned())
    }

    async fn get_borrow_position(&self, key: &PositionKey) -> Result<Option<BorrowPosition>, StoreError> {
        Ok(self.read()?.borrow.get(key).cloned())
    }

    async fn cursor(&self, market: &MarketKey) -> Result<Option<EventPosition>, StoreError> {
        Ok(self.read()?.cursors.get(market).copied())
    }

    async fn commit(&self, write: LedgerWrite) -> Result<(), StoreError> {
        if self.take_injected_failure() {
            return Err(StoreError::Unavailable("injected commit failure".to_string()));
        }

        let mut tables = self.write()?;
        match write.row {
            Some(LedgerRow::Market(m)) => {
                tables.markets.insert(m.key(), m);
            }
            Some(LedgerRow::Lend(p)) => {
                tables.lend.insert(p.key(), p);
            }
            Some(LedgerRow::Borrow(p)) => {
                tables.borrow.insert(p.key(), p);
            }
            None => {}
        }
        if let Some(position) = write.cursor {
            tables.cursors.insert(write.market, position);
        }
        Ok(())
    }

    async fn list_markets(&self) -> Result<Vec<Market>, StoreError> {
        Ok(self.read()?.markets.values().cloned().collect())
    }

    async fn list_lend_positions(&self, user: &Address) -> Result<Vec<LendPosition>, StoreError> {
        let tables = self.read()?;
        Ok(tables.lend.values().filter(|p| p.user == *user).cloned().collect())
    }

    async fn list_borrow_positions(&self, user: &Address) -> Result<Vec<BorrowPosition>, StoreError> {
        let tables = self.read()?;
        Ok(tables.borrow.values().filter(|p| p.user == *user).cloned().collect())
    }

    async fn list_market_positions(&self, market: &MarketKey) -> Result<MarketPositions, StoreError> {
        let tables = self.read()?;
        Ok(MarketPositions {
            lend: tables
                .lend
                .iter()
                .filter(|(k, _)| k.market == *market)
                .map(|(_, p)| p.clone())
                .collect(),
            borrow: tables
                .borrow
                .iter()
                .filter(|(k, _)| k.market == *market)
                .map(|(_, p)| p.clone())
                .collect(),
        })
    }

    async fn clear(&self) -> Result<(), StoreError> {
        *self.write()? = Tables::default();
        Ok(())
    }
}
