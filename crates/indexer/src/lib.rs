//! Ledger indexer application wiring.

pub mod app;

pub use app::{LedgerSnapshot, RunSummary, StoreChoice, run};
