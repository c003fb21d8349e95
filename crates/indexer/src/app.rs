//! Wires configuration, the ledger store, the event source and the
//! projection worker into one indexing run.

use std::io::BufRead;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use pbalend_events::{EventEnvelope, InMemoryEventBus};
use pbalend_infra::read_model::MarketPositions;
use pbalend_infra::{
    IndexerConfig, InMemoryLedgerStore, JsonlEventSource, LedgerQuery, LedgerStore, LendingLedgerProjection,
    PostgresLedgerStore, ProjectionStats, ProjectionWorker, WorkerExit,
};
use pbalend_lending::Market;

/// Where the ledger lives for this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreChoice {
    InMemory,
    /// Postgres at `database.url`; falls back to memory when no URL is set.
    Configured,
}

/// One market with all of its positions.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerSnapshot {
    pub market: Market,
    pub positions: MarketPositions,
}

#[derive(Debug)]
pub struct RunSummary {
    pub published: usize,
    pub stats: ProjectionStats,
    pub exit: WorkerExit,
    pub ledger: Vec<LedgerSnapshot>,
}

/// Index every envelope from `source` and return the resulting ledger.
pub fn run<R>(config: &IndexerConfig, source: JsonlEventSource<R>, store: StoreChoice) -> Result<RunSummary>
where
    R: BufRead,
{
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("pbalend-store")
        .build()
        .context("failed to start async runtime")?;

    match (store, config.database.url.as_deref()) {
        (StoreChoice::Configured, Some(url)) => {
            let pg = rt.block_on(async {
                let pg = PostgresLedgerStore::connect(url, &config.database.schema, config.database.max_connections)
                    .await?;
                pg.ensure_schema().await?;
                Ok::<_, pbalend_infra::StoreError>(pg)
            })?;
            info!(schema = %config.database.schema, "using postgres ledger store");
            run_pipeline(&rt, Arc::new(pg), config, source)
        }
        (StoreChoice::Configured, None) => {
            warn!("database.url not set; using in-memory ledger store");
            run_pipeline(&rt, Arc::new(InMemoryLedgerStore::new()), config, source)
        }
        (StoreChoice::InMemory, _) => run_pipeline(&rt, Arc::new(InMemoryLedgerStore::new()), config, source),
    }
}

fn run_pipeline<S, R>(
    rt: &tokio::runtime::Runtime,
    store: Arc<S>,
    config: &IndexerConfig,
    source: JsonlEventSource<R>,
) -> Result<RunSummary>
where
    S: LedgerStore + 'static,
    R: BufRead,
{
    let projection = Arc::new(LendingLedgerProjection::with_policy(store.clone(), config.market_policy()));
    let bus: Arc<InMemoryEventBus<EventEnvelope<JsonValue>>> = Arc::new(InMemoryEventBus::new());

    let worker = ProjectionWorker::spawn_ledger(
        "ledger-projection",
        bus.clone(),
        rt.handle().clone(),
        projection.clone(),
        config.retry_policy(),
    )
    .context("failed to spawn projection worker")?;

    let published = source
        .with_start_block(config.chain.start_block)
        .publish_to(&bus);
    bus.close();
    let exit = worker.join();
    let published = published.context("failed to read events")?;

    let stats = projection.stats();
    info!(
        published,
        applied = stats.applied,
        duplicates = stats.duplicates,
        skipped_missing = stats.skipped_missing,
        rejected = stats.rejected,
        clamp_anomalies = stats.clamp_anomalies,
        exit = ?exit,
        "indexing run finished"
    );

    let query = LedgerQuery::new(store);
    let ledger = rt.block_on(async {
        let mut ledger = Vec::new();
        for market in query.markets().await? {
            let positions = query.market_positions(market.key()).await?;
            ledger.push(LedgerSnapshot { market, positions });
        }
        Ok::<_, pbalend_infra::StoreError>(ledger)
    })?;

    Ok(RunSummary {
        published,
        stats,
        exit,
        ledger,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    use pbalend_core::Amount;

    const EVENTS: &str = r#"
{"block_number": 5, "log_index": 0, "payload": {"event": "MarketCreated", "args": {"loanToken": "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48", "collateralToken": "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2", "interestRate": "500", "LTV": "80"}}}
{"block_number": 6, "log_index": 0, "payload": {"event": "Deposit", "args": {"loanToken": "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48", "collateralToken": "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2", "user": "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa", "amount": "1000", "shares": "1000"}}}
{"block_number": 9, "log_index": 0, "payload": {"event": "Withdraw", "args": {"loanToken": "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48", "collateralToken": "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2", "user": "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa", "amount": "250", "shares": "250"}}}
"#;

    #[test]
    fn in_memory_run_reports_the_ledger() {
        let summary = run(
            &IndexerConfig::default(),
            JsonlEventSource::new(Cursor::new(EVENTS)),
            StoreChoice::InMemory,
        )
        .unwrap();

        assert_eq!(summary.published, 3);
        assert_eq!(summary.exit, WorkerExit::Disconnected);
        assert_eq!(summary.stats.applied, 3);
        assert_eq!(summary.ledger.len(), 1);

        let lend = &summary.ledger[0].positions.lend;
        assert_eq!(lend.len(), 1);
        assert_eq!(lend[0].amount, Amount::from(750u64));
    }

    #[test]
    fn start_block_skips_earlier_events() {
        let mut config = IndexerConfig::default();
        config.chain.start_block = 6;

        let summary = run(&config, JsonlEventSource::new(Cursor::new(EVENTS)), StoreChoice::Configured).unwrap();
        assert_eq!(summary.published, 2);
        // No MarketCreated was indexed, so no market rows to report.
        assert!(summary.ledger.is_empty());
        assert_eq!(summary.stats.applied, 2);
    }
}
