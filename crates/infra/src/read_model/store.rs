use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;

use pbalend_core::{Address, MarketKey, PositionKey};
use pbalend_events::EventPosition;
use pbalend_lending::{BorrowPosition, LendPosition, Market};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Backend unreachable or the operation timed out; the caller should retry.
    #[error("ledger store unavailable: {0}")]
    Unavailable(String),

    /// Stored data could not be read back into a row.
    #[error("ledger store corrupt: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// One row of any of the three ledger tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerRow {
    Market(Market),
    Lend(LendPosition),
    Borrow(BorrowPosition),
}

impl LedgerRow {
    /// Rendered key of the row (`loan-collateral[-user]`).
    pub fn key(&self) -> String {
        match self {
            LedgerRow::Market(m) => m.key().to_string(),
            LedgerRow::Lend(p) => p.key().to_string(),
            LedgerRow::Borrow(p) => p.key().to_string(),
        }
    }

    pub fn table(&self) -> &'static str {
        match self {
            LedgerRow::Market(_) => "markets",
            LedgerRow::Lend(_) => "lend_positions",
            LedgerRow::Borrow(_) => "borrow_positions",
        }
    }
}

/// The write produced by applying one event: at most one row, plus the
/// market cursor when the event came with a chain position.
///
/// Stores must apply both parts or neither.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerWrite {
    pub market: MarketKey,
    pub row: Option<LedgerRow>,
    pub cursor: Option<EventPosition>,
}

impl LedgerWrite {
    pub fn new(market: MarketKey) -> Self {
        Self {
            market,
            row: None,
            cursor: None,
        }
    }

    pub fn with_row(mut self, row: LedgerRow) -> Self {
        self.row = Some(row);
        self
    }

    pub fn with_cursor(mut self, position: EventPosition) -> Self {
        self.cursor = Some(position);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.row.is_none() && self.cursor.is_none()
    }
}

/// All lend and borrow rows of one market.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MarketPositions {
    pub lend: Vec<LendPosition>,
    pub borrow: Vec<BorrowPosition>,
}

/// Durable keyed storage for the ledger tables and per-market cursors.
///
/// Reads never observe half of a `commit`. Listing order is by key.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn get_market(&self, key: &MarketKey) -> Result<Option<Market>, StoreError>;
    async fn get_lend_position(&self, key: &PositionKey) -> Result<Option<LendPosition>, StoreError>;
    async fn get_borrow_position(&self, key: &PositionKey) -> Result<Option<BorrowPosition>, StoreError>;

    /// Position of the last event applied to `market`, if any.
    async fn cursor(&self, market: &MarketKey) -> Result<Option<EventPosition>, StoreError>;

    async fn commit(&self, write: LedgerWrite) -> Result<(), StoreError>;

    async fn list_markets(&self) -> Result<Vec<Market>, StoreError>;
    async fn list_lend_positions(&self, user: &Address) -> Result<Vec<LendPosition>, StoreError>;
    async fn list_borrow_positions(&self, user: &Address) -> Result<Vec<BorrowPosition>, StoreError>;
    async fn list_market_positions(&self, market: &MarketKey) -> Result<MarketPositions, StoreError>;

    /// Drop every row and cursor (rebuild support).
    async fn clear(&self) -> Result<(), StoreError>;
}

#[async_trait]
impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    async fn get_market(&self, key: &MarketKey) -> Result<Option<Market>, StoreError> {
        (**self).get_market(key).await
    }

    async fn get_lend_position(&self, key: &PositionKey) -> Result<Option<LendPosition>, StoreError> {
        (**self).get_lend_position(key).await
    }

    async fn get_borrow_position(&self, key: &PositionKey) -> Result<Option<BorrowPosition>, StoreError> {
        (**self).get_borrow_position(key).await
    }

    async fn cursor(&self, market: &MarketKey) -> Result<Option<EventPosition>, StoreError> {
        (**self).cursor(market).await
    }

    async fn commit(&self, write: LedgerWrite) -> Result<(), StoreError> {
        (**self).commit(write).await
    }

    async fn list_markets(&self) -> Result<Vec<Market>, StoreError> {
        (**self).list_markets().await
    }

    async fn list_lend_positions(&self, user: &Address) -> Result<Vec<LendPosition>, StoreError> {
        (**self).list_lend_positions(user).await
    }

    async fn list_borrow_positions(&self, user: &Address) -> Result<Vec<BorrowPosition>, StoreError> {
        (**self).list_borrow_positions(user).await
    }

    async fn list_market_positions(&self, market: &MarketKey) -> Result<MarketPositions, StoreError> {
        (**self).list_market_positions(market).await
    }

    async fn clear(&self) -> Result<(), StoreError> {
        (**self).clear().await
    }
}
