//! Chain-event mechanics: envelopes, ordering positions, pub/sub.
//!
//! Nothing in here knows about lending; the domain events live in
//! `pbalend-lending` and travel through these types as payloads.

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;

pub use bus::{EventBus, Subscription};
pub use envelope::{EventEnvelope, EventPosition};
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
