//! Integration tests for the full projection pipeline.
//!
//! Tests: JSON-lines source → EventBus → ProjectionWorker → LedgerStore → LedgerQuery
//!
//! Verifies:
//! - The reference lending scenario ends in the expected ledger
//! - Redelivered and stale envelopes are ignored
//! - Store outages are retried, not dropped
//! - Markets are independent of each other

#[cfg(test)]
mod tests {
    use std::io::Cursor;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::{Value as JsonValue, json};

    use pbalend_core::{Address, Amount, MarketKey};
    use pbalend_events::{EventBus, EventEnvelope, EventPosition, InMemoryEventBus};

    use crate::projections::LendingLedgerProjection;
    use crate::query::LedgerQuery;
    use crate::read_model::{InMemoryLedgerStore, LedgerStore};
    use crate::source::JsonlEventSource;
    use crate::workers::{ProjectionWorker, RetryPolicy, WorkerExit, WorkerHandle};

    const USDC: &str = "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48";
    const WETH: &str = "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2";
    const WBTC: &str = "0x2260fac5e5542a773aa44fbcfedf7c193bc2c599";
    const ALICE: &str = "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const BOB: &str = "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    type Bus = Arc<InMemoryEventBus<EventEnvelope<JsonValue>>>;
    type Projection = Arc<LendingLedgerProjection<Arc<InMemoryLedgerStore>>>;

    struct Pipeline {
        rt: tokio::runtime::Runtime,
        bus: Bus,
        store: Arc<InMemoryLedgerStore>,
        projection: Projection,
        worker: WorkerHandle,
    }

    fn setup() -> Pipeline {
        let rt = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap();
        let store = Arc::new(InMemoryLedgerStore::new());
        let projection = Arc::new(LendingLedgerProjection::new(store.clone()));
        let bus: Bus = Arc::new(InMemoryEventBus::new());

        // Subscribe before anything is published.
        let worker = ProjectionWorker::spawn_ledger(
            "ledger-test",
            bus.clone(),
            rt.handle().clone(),
            projection.clone(),
            RetryPolicy {
                max_attempts: 4,
                delay: Duration::from_millis(5),
            },
        )
        .unwrap();

        Pipeline {
            rt,
            bus,
            store,
            projection,
            worker,
        }
    }

    impl Pipeline {
        /// Close the bus and wait until the worker drained it.
        fn drain(self) -> (tokio::runtime::Runtime, Arc<InMemoryLedgerStore>, Projection, WorkerExit) {
            self.bus.close();
            let exit = self.worker.join();
            (self.rt, self.store, self.projection, exit)
        }
    }

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    fn amt(v: u64) -> Amount {
        Amount::from(v)
    }

    fn line(block: u64, log: u64, event: &str, args: JsonValue) -> String {
        json!({"block_number": block, "log_index": log, "payload": {"event": event, "args": args}}).to_string()
    }

    fn scenario_lines() -> String {
        [
            line(100, 0, "MarketCreated", json!({"loanToken": USDC, "collateralToken": WETH, "interestRate": "500", "LTV": "80"})),
            line(101, 2, "Deposit", json!({"loanToken": USDC, "collateralToken": WETH, "user": ALICE, "amount": "1000", "shares": "1000"})),
            line(102, 0, "Borrow", json!({"loanToken": USDC, "collateralToken": WETH, "user": BOB, "amount": "400", "shares": "400", "collateralAmount": "1"})),
            line(103, 1, "Repay", json!({"loanToken": USDC, "collateralToken": WETH, "user": BOB, "shares": "400", "amount": "400"})),
        ]
        .join("\n")
    }

    #[test]
    fn reference_scenario_projects_expected_ledger() {
        let pipeline = setup();
        let published = JsonlEventSource::new(Cursor::new(scenario_lines()))
            .publish_to(&pipeline.bus)
            .unwrap();
        assert_eq!(published, 4);

        let (rt, store, projection, exit) = pipeline.drain();
        assert_eq!(exit, WorkerExit::Disconnected);

        let query = LedgerQuery::new(store);
        rt.block_on(async {
            let market = query.market(addr(USDC), addr(WETH)).await.unwrap().unwrap();
            assert_eq!((market.interest_rate, market.ltv), (amt(500), amt(80)));

            let lend = query.lend_position(addr(USDC), addr(WETH), addr(ALICE)).await.unwrap().unwrap();
            assert_eq!((lend.amount, lend.shares), (amt(1000), amt(1000)));

            let debt = query.borrow_position(addr(USDC), addr(WETH), addr(BOB)).await.unwrap().unwrap();
            assert_eq!((debt.amount, debt.shares, debt.collateral_amount), (amt(0), amt(0), amt(1)));

            assert_eq!(query.lend_position(addr(USDC), addr(WETH), addr(BOB)).await.unwrap(), None);
        });
        assert_eq!(projection.stats().applied, 4);
    }

    #[test]
    fn redelivered_and_stale_envelopes_are_ignored() {
        let pipeline = setup();
        let envs = JsonlEventSource::new(Cursor::new(scenario_lines())).read_all().unwrap();

        // Full redelivery, then a stale replay of the first deposit.
        for env in envs.iter().chain(envs.iter()) {
            pipeline.bus.publish(env.clone()).unwrap();
        }
        pipeline.bus.publish(envs[1].clone()).unwrap();

        let (rt, store, projection, _) = pipeline.drain();
        let query = LedgerQuery::new(store);
        let lend = rt
            .block_on(query.lend_position(addr(USDC), addr(WETH), addr(ALICE)))
            .unwrap()
            .unwrap();
        assert_eq!(lend.amount, amt(1000));

        let stats = projection.stats();
        assert_eq!(stats.applied, 4);
        assert_eq!(stats.duplicates, 5);
    }

    #[test]
    fn store_outage_is_retried_until_the_event_lands() {
        let pipeline = setup();
        pipeline.store.fail_next_commits(2);

        let deposit = line(7, 0, "Deposit", json!({"loanToken": USDC, "collateralToken": WETH, "user": ALICE, "amount": 5, "shares": 5}));
        JsonlEventSource::new(Cursor::new(deposit)).publish_to(&pipeline.bus).unwrap();

        let (rt, store, _, exit) = pipeline.drain();
        assert_eq!(exit, WorkerExit::Disconnected);

        let lend = rt
            .block_on(LedgerQuery::new(store).lend_position(addr(USDC), addr(WETH), addr(ALICE)))
            .unwrap()
            .unwrap();
        assert_eq!(lend.amount, amt(5));
    }

    #[test]
    fn persistent_outage_halts_without_dropping_the_event() {
        let pipeline = setup();
        pipeline.store.fail_next_commits(100);

        let deposit = line(7, 0, "Deposit", json!({"loanToken": USDC, "collateralToken": WETH, "user": ALICE, "amount": 5, "shares": 5}));
        JsonlEventSource::new(Cursor::new(deposit)).publish_to(&pipeline.bus).unwrap();

        let (rt, store, _, exit) = pipeline.drain();
        assert!(matches!(exit, WorkerExit::Halted { attempts: 4, .. }));

        let market = MarketKey::new(addr(USDC), addr(WETH));
        let cursor = rt.block_on(store.cursor(&market)).unwrap();
        assert_eq!(cursor, None);
    }

    #[test]
    fn malformed_events_are_dropped_and_markets_stay_independent() {
        let pipeline = setup();
        let lines = [
            line(1, 0, "Deposit", json!({"loanToken": USDC, "collateralToken": WETH, "user": ALICE, "amount": 10, "shares": 10})),
            line(1, 1, "Deposit", json!({"loanToken": USDC, "collateralToken": WETH, "user": ALICE})),
            line(2, 0, "Deposit", json!({"loanToken": USDC, "collateralToken": WBTC, "user": ALICE, "amount": 3, "shares": 3})),
            line(2, 1, "Withdraw", json!({"loanToken": USDC, "collateralToken": WETH, "user": ALICE, "amount": 4, "shares": 4})),
        ]
        .join("\n");
        JsonlEventSource::new(Cursor::new(lines)).publish_to(&pipeline.bus).unwrap();

        let (rt, store, projection, _) = pipeline.drain();
        let query = LedgerQuery::new(store);
        rt.block_on(async {
            let weth = query.lend_position(addr(USDC), addr(WETH), addr(ALICE)).await.unwrap().unwrap();
            assert_eq!(weth.amount, amt(6));

            let wbtc = query.lend_position(addr(USDC), addr(WBTC), addr(ALICE)).await.unwrap().unwrap();
            assert_eq!(wbtc.amount, amt(3));

            assert_eq!(query.lend_positions_of(addr(ALICE)).await.unwrap().len(), 2);
        });
        assert_eq!(projection.stats().rejected, 1);

        let cursor = rt
            .block_on(projection.store().cursor(&MarketKey::new(addr(USDC), addr(WBTC))))
            .unwrap();
        assert_eq!(cursor, Some(EventPosition::new(2, 0)));
    }
}
