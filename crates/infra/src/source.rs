//! File-backed event source: newline-delimited JSON envelopes.
//!
//! One envelope per line, in the decoded-log shape:
//!
//! ```text
//! {"block_number": 7, "log_index": 2, "transaction_hash": "0x..", "payload": {"event": "Deposit", "args": {..}}}
//! ```

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::debug;

use pbalend_events::{EventBus, EventEnvelope};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to read events: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed envelope on line {line}: {message}")]
    Malformed { line: usize, message: String },

    #[error("failed to publish envelope: {0}")]
    Publish(String),
}

/// Reads envelopes from a JSON-lines stream.
#[derive(Debug)]
pub struct JsonlEventSource<R> {
    reader: R,
    start_block: u64,
}

impl JsonlEventSource<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R> JsonlEventSource<R>
where
    R: BufRead,
{
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            start_block: 0,
        }
    }

    /// Drop envelopes from blocks before `block`.
    pub fn with_start_block(mut self, block: u64) -> Self {
        self.start_block = block;
        self
    }

    /// Read every envelope, in chain order (stable for equal positions).
    ///
    /// Blank lines are ignored; the first malformed line fails the read.
    pub fn read_all(self) -> Result<Vec<EventEnvelope<JsonValue>>, SourceError> {
        let start_block = self.start_block;
        let mut envs = Vec::new();
        let mut below_start = 0usize;

        for (idx, line) in self.reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }

            let env: EventEnvelope<JsonValue> =
                serde_json::from_str(&line).map_err(|e| SourceError::Malformed {
                    line: idx + 1,
                    message: e.to_string(),
                })?;

            if env.position().block_number < start_block {
                below_start += 1;
                continue;
            }
            envs.push(env);
        }

        envs.sort_by_key(|e| e.position());
        debug!(envelopes = envs.len(), below_start, start_block, "event source read");
        Ok(envs)
    }

    /// Read everything and publish it to `bus`; returns the number published.
    pub fn publish_to<B>(self, bus: &B) -> Result<usize, SourceError>
    where
        B: EventBus<EventEnvelope<JsonValue>>,
    {
        let envs = self.read_all()?;
        let count = envs.len();
        for env in envs {
            bus.publish(env)
                .map_err(|e| SourceError::Publish(format!("{e:?}")))?;
        }
        Ok(count)
    }
}
