//! Ledger storage: the store contract and its adapters.

pub mod in_memory;
pub mod postgres;
pub mod store;

pub use in_memory::InMemoryLedgerStore;
pub use postgres::PostgresLedgerStore;
pub use store::{LedgerRow, LedgerStore, LedgerWrite, MarketPositions, StoreError};
