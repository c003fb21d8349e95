use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use pbalend_events::EventEnvelope;
use pbalend_lending::{LendingEvent, MarketPolicy};

use super::engine::{Applied, LedgerEngine, ProjectionError, ProjectionStats};
use crate::read_model::LedgerStore;

/// Counts from one `rebuild_from_scratch` run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RebuildReport {
    pub replayed: u64,
    pub rejected: u64,
}

/// Lending ledger projection.
///
/// Consumes published envelopes (JSON payloads) and maintains the market and
/// position tables. Delivery may be at-least-once: every market keeps a
/// cursor at the last applied (block, log index), and envelopes at or before
/// it are ignored. The cursor is committed together with the row it guards.
#[derive(Debug)]
pub struct LendingLedgerProjection<S> {
    engine: LedgerEngine<S>,
}

impl<S> LendingLedgerProjection<S>
where
    S: LedgerStore,
{
    pub fn new(store: S) -> Self {
        Self {
            engine: LedgerEngine::new(store),
        }
    }

    pub fn with_policy(store: S, policy: MarketPolicy) -> Self {
        Self {
            engine: LedgerEngine::with_policy(store, policy),
        }
    }

    pub fn engine(&self) -> &LedgerEngine<S> {
        &self.engine
    }

    pub fn store(&self) -> &S {
        self.engine.store()
    }

    pub fn stats(&self) -> ProjectionStats {
        self.engine.stats()
    }

    /// Apply a published envelope into the projection.
    ///
    /// - Malformed payloads are rejected before anything is read or written
    /// - Replays at or before the market cursor are ignored
    pub async fn apply_envelope(&self, envelope: &EventEnvelope<JsonValue>) -> Result<Applied, ProjectionError> {
        let event: LendingEvent = serde_json::from_value(envelope.payload().clone()).map_err(|e| {
            self.engine.record_rejected();
            ProjectionError::Deserialize(e.to_string())
        })?;

        self.engine.apply_at(&event, envelope.position()).await
    }

    /// Rebuild the ledger from scratch by replaying envelopes.
    ///
    /// Envelopes are replayed in chain order regardless of input order.
    /// Rejected events are skipped as they would be on the live path; a store
    /// failure aborts the rebuild.
    pub async fn rebuild_from_scratch(
        &self,
        envelopes: impl IntoIterator<Item = EventEnvelope<JsonValue>>,
    ) -> Result<RebuildReport, ProjectionError> {
        self.engine.store().clear().await?;

        let mut envs: Vec<_> = envelopes.into_iter().collect();
        envs.sort_by_key(|e| e.position());

        let mut report = RebuildReport::default();
        for env in &envs {
            match self.apply_envelope(env).await {
                Ok(_) => report.replayed += 1,
                Err(err @ ProjectionError::Store(_)) => return Err(err),
                Err(err) => {
                    report.rejected += 1;
                    warn!(position = %env.position(), error = %err, "skipping rejected event during rebuild");
                }
            }
        }

        info!(replayed = report.replayed, rejected = report.rejected, "ledger rebuilt");
        Ok(report)
    }
}
