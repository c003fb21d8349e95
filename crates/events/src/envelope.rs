use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Position of a log in the chain: block height, then log index within the block.
///
/// Ordering is lexicographic on `(block_number, log_index)`, which is the order
/// the contract emitted the events in. A position is unique per log, so it also
/// serves as the deduplication key.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventPosition {
    pub block_number: u64,
    pub log_index: u64,
}

impl EventPosition {
    pub fn new(block_number: u64, log_index: u64) -> Self {
        Self {
            block_number,
            log_index,
        }
    }
}

impl core::fmt::Display for EventPosition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}:{}", self.block_number, self.log_index)
    }
}

/// Envelope for a chain event, containing ordering + provenance metadata.
///
/// This is the unit an event source delivers (at-least-once).
///
/// Notes:
/// - `position` orders events and identifies duplicates.
/// - `transaction_hash` / `block_timestamp` are provenance only; they never
///   influence projection state.
/// - `payload` is the decoded event (typed, or raw JSON before decoding).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope<E> {
    #[serde(flatten)]
    position: EventPosition,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    transaction_hash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    block_timestamp: Option<DateTime<Utc>>,

    payload: E,
}

impl<E> EventEnvelope<E> {
    pub fn new(position: EventPosition, payload: E) -> Self {
        Self {
            position,
            transaction_hash: None,
            block_timestamp: None,
            payload,
        }
    }

    pub fn with_transaction_hash(mut self, hash: impl Into<String>) -> Self {
        self.transaction_hash = Some(hash.into());
        self
    }

    pub fn with_block_timestamp(mut self, at: DateTime<Utc>) -> Self {
        self.block_timestamp = Some(at);
        self
    }

    pub fn position(&self) -> EventPosition {
        self.position
    }

    pub fn transaction_hash(&self) -> Option<&str> {
        self.transaction_hash.as_deref()
    }

    pub fn block_timestamp(&self) -> Option<DateTime<Utc>> {
        self.block_timestamp
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }

    /// Replace the payload, keeping the metadata (e.g. after decoding JSON).
    pub fn map_payload<F, T>(self, f: F) -> EventEnvelope<T>
    where
        F: FnOnce(E) -> T,
    {
        EventEnvelope {
            position: self.position,
            transaction_hash: self.transaction_hash,
            block_timestamp: self.block_timestamp,
            payload: f(self.payload),
        }
    }
}
