//! Event delivery abstraction (mechanics only).
//!
//! The bus is how an event source hands chain events to consumers (the ledger
//! projection worker, tests, tooling). It is deliberately small:
//!
//! - **Transport-agnostic**: in-memory channels today, a chain client feeding a
//!   queue tomorrow.
//! - **At-least-once delivery**: a message may arrive more than once (reorg
//!   handling, source restarts, retries). Consumers deduplicate by
//!   `EventPosition`.
//! - **No persistence**: the chain is the source of truth; a lost message is
//!   recovered by re-reading from the last cursor.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvError, RecvTimeoutError, TryRecvError};
use std::time::Duration;

/// A subscription to an event stream.
///
/// Each subscription receives a copy of every message published after it was
/// created (broadcast semantics), in publish order.
///
/// ```ignore
/// let subscription = bus.subscribe();
/// loop {
///     match subscription.recv_timeout(Duration::from_millis(250)) {
///         Ok(envelope) => projection.apply_envelope(&envelope).await?,
///         Err(RecvTimeoutError::Timeout) => continue,       // check for shutdown
///         Err(RecvTimeoutError::Disconnected) => break,     // source finished
///     }
/// }
/// ```
///
/// Subscriptions are meant for a single consuming thread.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: Receiver<M>) -> Self {
        Self { receiver }
    }

    /// Block until the next message is available.
    pub fn recv(&self) -> Result<M, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message without blocking.
    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Block for up to `timeout` waiting for a message.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// Domain-agnostic event bus (pub/sub abstraction).
///
/// ```text
/// chain source ──publish──▶ EventBus ──subscribe──▶ projection worker ──▶ ledger store
/// ```
///
/// `publish()` may fail (closed transport, poisoned lock); the caller decides
/// whether to retry. Since consumers deduplicate, republishing is always safe.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
