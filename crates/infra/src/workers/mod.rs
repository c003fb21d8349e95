//! Background workers.

pub mod projection_worker;

pub use projection_worker::{ProjectionWorker, RetryPolicy, Retryable, WorkerExit, WorkerHandle};
