//! Infrastructure layer: ledger storage, projection, event delivery, config.

pub mod config;
pub mod projections;
pub mod query;
pub mod read_model;
pub mod source;
pub mod workers;

mod integration_tests;

pub use config::{ConfigError, IndexerConfig};
pub use projections::{Applied, LedgerEngine, LendingLedgerProjection, ProjectionError, ProjectionStats};
pub use query::LedgerQuery;
pub use read_model::{InMemoryLedgerStore, LedgerStore, PostgresLedgerStore, StoreError};
pub use source::{JsonlEventSource, SourceError};
pub use workers::{ProjectionWorker, RetryPolicy, WorkerExit, WorkerHandle};
