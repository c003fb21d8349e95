//! Read-only access to the ledger for external consumers.
//!
//! A key no event ever touched reads as `None`, never as a zero row, so
//! callers can tell "never deposited" from "fully withdrawn".

use pbalend_core::{Address, MarketKey, PositionKey};
use pbalend_lending::{BorrowPosition, LendPosition, Market};

use crate::read_model::{LedgerStore, MarketPositions, StoreError};

#[derive(Debug, Clone)]
pub struct LedgerQuery<S> {
    store: S,
}

impl<S> LedgerQuery<S>
where
    S: LedgerStore,
{
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub async fn market(&self, loan_token: Address, collateral_token: Address) -> Result<Option<Market>, StoreError> {
        self.store.get_market(&MarketKey::new(loan_token, collateral_token)).await
    }

    pub async fn lend_position(
        &self,
        loan_token: Address,
        collateral_token: Address,
        user: Address,
    ) -> Result<Option<LendPosition>, StoreError> {
        self.store
            .get_lend_position(&PositionKey::new(loan_token, collateral_token, user))
            .await
    }

    pub async fn borrow_position(
        &self,
        loan_token: Address,
        collateral_token: Address,
        user: Address,
    ) -> Result<Option<BorrowPosition>, StoreError> {
        self.store
            .get_borrow_position(&PositionKey::new(loan_token, collateral_token, user))
            .await
    }

    pub async fn markets(&self) -> Result<Vec<Market>, StoreError> {
        self.store.list_markets().await
    }

    pub async fn lend_positions_of(&self, user: Address) -> Result<Vec<LendPosition>, StoreError> {
        self.store.list_lend_positions(&user).await
    }

    pub async fn borrow_positions_of(&self, user: Address) -> Result<Vec<BorrowPosition>, StoreError> {
        self.store.list_borrow_positions(&user).await
    }

    pub async fn market_positions(&self, market: MarketKey) -> Result<MarketPositions, StoreError> {
        self.store.list_market_positions(&market).await
    }
}
