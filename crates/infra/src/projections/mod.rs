//! Projection implementations (read model builders).
//!
//! The lending ledger is:
//! - **Rebuildable**: can be reconstructed from the event stream
//! - **Ordered per market**: (block, log index) cursors guard every market
//! - **Idempotent**: safe for at-least-once delivery

pub mod engine;
pub mod lending_ledger;

pub use engine::{Applied, LedgerEngine, ProjectionError, ProjectionStats};
pub use lending_ledger::{LendingLedgerProjection, RebuildReport};
