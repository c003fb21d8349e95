use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use serde_json::Value as JsonValue;
use tracing::{error, info, warn};

use pbalend_events::{EventBus, EventEnvelope, Subscription};

use crate::projections::{LendingLedgerProjection, ProjectionError};
use crate::read_model::LedgerStore;

/// Failures that may succeed when the same message is handled again.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for ProjectionError {
    fn is_retryable(&self) -> bool {
        ProjectionError::is_retryable(self)
    }
}

/// Redelivery policy for retryable handler failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per message, including the first.
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_millis(500),
        }
    }
}

/// Why a worker loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// `WorkerHandle::shutdown` was called.
    Shutdown,
    /// The bus dropped the subscription and everything published was handled.
    Disconnected,
    /// A message kept failing with a retryable error. It was not dropped;
    /// restart from the stored cursors to redeliver it.
    Halted { attempts: u32, error: String },
}

/// Handle to control and join a background worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<WorkerExit>>,
}

impl WorkerHandle {
    /// Request graceful shutdown and wait for the worker to stop.
    pub fn shutdown(self) -> WorkerExit {
        let _ = self.shutdown.send(());
        self.join()
    }

    /// Wait for the worker to stop on its own (bus closed or halted).
    pub fn join(mut self) -> WorkerExit {
        match self.join.take().map(|j| j.join()) {
            Some(Ok(exit)) => exit,
            Some(Err(_)) => WorkerExit::Halted {
                attempts: 0,
                error: "worker thread panicked".to_string(),
            },
            None => WorkerExit::Shutdown,
        }
    }
}

/// Generic projection worker loop.
///
/// - Subscribes to an event bus
/// - Applies an idempotent handler for each message
/// - Redelivers a message on retryable failure, per `RetryPolicy`
/// - Supports graceful shutdown
#[derive(Debug)]
pub struct ProjectionWorker;

impl ProjectionWorker {
    /// Spawn a worker thread that processes messages from the bus subscription.
    ///
    /// `handler` must be idempotent (at-least-once delivery safe).
    pub fn spawn<M, B, H, E>(
        name: &'static str,
        bus: B,
        retry: RetryPolicy,
        mut handler: H,
    ) -> std::io::Result<WorkerHandle>
    where
        M: Send + 'static,
        B: EventBus<M> + Send + Sync + 'static,
        H: FnMut(&M) -> Result<(), E> + Send + 'static,
        E: Retryable + core::fmt::Debug + Send + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let sub: Subscription<M> = bus.subscribe();

        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || worker_loop(name, sub, shutdown_rx, retry, &mut handler))?;

        Ok(WorkerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }

    /// Spawn a worker feeding `projection` from `bus`.
    ///
    /// Store calls run on `runtime`; the worker thread itself must not be a
    /// runtime thread.
    pub fn spawn_ledger<B, S>(
        name: &'static str,
        bus: B,
        runtime: tokio::runtime::Handle,
        projection: Arc<LendingLedgerProjection<S>>,
        retry: RetryPolicy,
    ) -> std::io::Result<WorkerHandle>
    where
        B: EventBus<EventEnvelope<JsonValue>> + Send + Sync + 'static,
        S: LedgerStore + 'static,
    {
        Self::spawn(name, bus, retry, move |env: &EventEnvelope<JsonValue>| {
            runtime.block_on(projection.apply_envelope(env)).map(|_| ())
        })
    }
}

fn worker_loop<M, H, E>(
    name: &'static str,
    sub: Subscription<M>,
    shutdown_rx: mpsc::Receiver<()>,
    retry: RetryPolicy,
    handler: &mut H,
) -> WorkerExit
where
    H: FnMut(&M) -> Result<(), E>,
    E: Retryable + core::fmt::Debug,
{
    let tick = Duration::from_millis(250);

    loop {
        // Shutdown check (non-blocking)
        if shutdown_rx.try_recv().is_ok() {
            return WorkerExit::Shutdown;
        }

        let msg = match sub.recv_timeout(tick) {
            Ok(msg) => msg,
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                info!(worker = name, "event bus closed; worker stopping");
                return WorkerExit::Disconnected;
            }
        };

        let mut attempt = 1;
        loop {
            match handler(&msg) {
                Ok(()) => break,
                Err(err) if err.is_retryable() && attempt < retry.max_attempts => {
                    warn!(worker = name, attempt, error = ?err, "retryable failure; redelivering");
                    match shutdown_rx.recv_timeout(retry.delay) {
                        Ok(()) => return WorkerExit::Shutdown,
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => thread::sleep(retry.delay),
                    }
                    attempt += 1;
                }
                Err(err) if err.is_retryable() => {
                    error!(worker = name, attempts = attempt, error = ?err, "retries exhausted; worker halting");
                    return WorkerExit::Halted {
                        attempts: attempt,
                        error: format!("{err:?}"),
                    };
                }
                Err(err) => {
                    warn!(worker = name, error = ?err, "projection worker handler failed");
                    break;
                }
            }
        }
    }
}
