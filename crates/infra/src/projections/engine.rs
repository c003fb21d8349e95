//! Projection engine: applies one lending event to the ledger.
//!
//! Each application reads the current row of the touched key, runs the pure
//! reducer from `pbalend-lending`, and commits the result. Applications for
//! the same market are serialized; different markets proceed concurrently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use pbalend_core::{DomainError, MarketKey};
use pbalend_events::{Event, EventPosition};
use pbalend_lending::{
    Borrow, BorrowPosition, ClampedField, Deposit, LendPosition, LendingEvent, Market, MarketCreated,
    MarketPolicy, NoChange, Repay, Transition, Withdraw, WithdrawCollateral,
};

use crate::read_model::{LedgerRow, LedgerStore, LedgerWrite, StoreError};

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("failed to deserialize lending event: {0}")]
    Deserialize(String),

    #[error("event rejected: {0}")]
    Rejected(#[from] DomainError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ProjectionError {
    /// Whether redelivering the same event may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProjectionError::Store(e) if e.is_retryable())
    }
}

/// What applying one event did to the ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// A row was written; `clamped` lists fields that hit the zero floor.
    Written { clamped: Vec<ClampedField> },
    /// `MarketCreated` for a market that already exists.
    AlreadyExists,
    /// Decrement for a position that was never opened.
    Skipped,
    /// At or before the market cursor; already applied.
    Duplicate,
}

/// Running counters of an engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProjectionStats {
    /// Events that wrote a row.
    pub applied: u64,
    pub duplicates: u64,
    /// `MarketCreated` for a market already recorded; nothing written.
    pub repeated_creations: u64,
    pub skipped_missing: u64,
    pub rejected: u64,
    /// Decrements that asked for more than the stored balance.
    pub clamp_anomalies: u64,
}

#[derive(Debug, Default)]
struct Counters {
    applied: AtomicU64,
    duplicates: AtomicU64,
    repeated_creations: AtomicU64,
    skipped_missing: AtomicU64,
    rejected: AtomicU64,
    clamp_anomalies: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ProjectionStats {
        ProjectionStats {
            applied: self.applied.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            repeated_creations: self.repeated_creations.load(Ordering::Relaxed),
            skipped_missing: self.skipped_missing.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            clamp_anomalies: self.clamp_anomalies.load(Ordering::Relaxed),
        }
    }
}

/// Applies lending events to a `LedgerStore`.
#[derive(Debug)]
pub struct LedgerEngine<S> {
    store: S,
    policy: MarketPolicy,
    guards: Mutex<HashMap<MarketKey, Arc<AsyncMutex<()>>>>,
    counters: Counters,
}

impl<S> LedgerEngine<S>
where
    S: LedgerStore,
{
    pub fn new(store: S) -> Self {
        Self::with_policy(store, MarketPolicy::default())
    }

    pub fn with_policy(store: S, policy: MarketPolicy) -> Self {
        Self {
            store,
            policy,
            guards: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn policy(&self) -> &MarketPolicy {
        &self.policy
    }

    pub fn stats(&self) -> ProjectionStats {
        self.counters.snapshot()
    }

    pub(crate) fn record_rejected(&self) {
        Counters::bump(&self.counters.rejected);
    }

    pub async fn apply_market_created(&self, ev: &MarketCreated) -> Result<Applied, ProjectionError> {
        self.apply(&LendingEvent::from(ev.clone())).await
    }

    pub async fn apply_deposit(&self, ev: &Deposit) -> Result<Applied, ProjectionError> {
        self.apply(&LendingEvent::from(ev.clone())).await
    }

    pub async fn apply_borrow(&self, ev: &Borrow) -> Result<Applied, ProjectionError> {
        self.apply(&LendingEvent::from(ev.clone())).await
    }

    pub async fn apply_repay(&self, ev: &Repay) -> Result<Applied, ProjectionError> {
        self.apply(&LendingEvent::from(ev.clone())).await
    }

    pub async fn apply_withdraw(&self, ev: &Withdraw) -> Result<Applied, ProjectionError> {
        self.apply(&LendingEvent::from(ev.clone())).await
    }

    pub async fn apply_withdraw_collateral(&self, ev: &WithdrawCollateral) -> Result<Applied, ProjectionError> {
        self.apply(&LendingEvent::from(ev.clone())).await
    }

    /// Apply an event that carries no chain position (no dedup, no cursor).
    pub async fn apply(&self, event: &LendingEvent) -> Result<Applied, ProjectionError> {
        self.apply_inner(event, None).await
    }

    /// Apply an event at `position`.
    ///
    /// Positions at or before the market cursor are reported as
    /// `Applied::Duplicate` without touching the store. Otherwise the row and
    /// the advanced cursor are committed together.
    pub async fn apply_at(&self, event: &LendingEvent, position: EventPosition) -> Result<Applied, ProjectionError> {
        self.apply_inner(event, Some(position)).await
    }

    fn guard(&self, market: &MarketKey) -> Arc<AsyncMutex<()>> {
        let mut guards = self.guards.lock().unwrap_or_else(|p| p.into_inner());
        guards.entry(*market).or_default().clone()
    }

    async fn apply_inner(
        &self,
        event: &LendingEvent,
        position: Option<EventPosition>,
    ) -> Result<Applied, ProjectionError> {
        let market = event.market();
        let guard = self.guard(&market);
        let _held = guard.lock().await;

        if let Some(at) = position {
            if let Some(last) = self.store.cursor(&market).await? {
                if at <= last {
                    Counters::bump(&self.counters.duplicates);
                    debug!(event = event.event_type(), %market, %at, %last, "duplicate event ignored");
                    return Ok(Applied::Duplicate);
                }
            }
        }

        let transition = match self.reduce(event).await {
            Ok(t) => t,
            Err(ProjectionError::Rejected(err)) => {
                self.record_rejected();
                warn!(event = event.event_type(), %market, error = %err, "event rejected");
                return Err(ProjectionError::Rejected(err));
            }
            Err(err) => return Err(err),
        };

        let mut write = LedgerWrite::new(market);
        if let Some(at) = position {
            write = write.with_cursor(at);
        }

        let applied = match transition {
            Transition::Unchanged(reason) => {
                self.store.commit(write).await?;
                match reason {
                    NoChange::AlreadyExists => {
                        Counters::bump(&self.counters.repeated_creations);
                        debug!(%market, "market already exists; keeping first creation");
                        Applied::AlreadyExists
                    }
                    NoChange::MissingAggregate => {
                        Counters::bump(&self.counters.skipped_missing);
                        warn!(
                            event = event.event_type(),
                            position = ?event.position().map(|k| k.to_string()),
                            "decrement for a position that was never opened; skipped"
                        );
                        Applied::Skipped
                    }
                }
            }
            Transition::Write { row, clamped } => {
                let key = row.key();
                self.store.commit(write.with_row(row)).await?;
                Counters::bump(&self.counters.applied);

                if !clamped.is_empty() {
                    Counters::bump(&self.counters.clamp_anomalies);
                    let fields: Vec<String> = clamped.iter().map(ToString::to_string).collect();
                    warn!(event = event.event_type(), %key, clamped = ?fields, "decrement exceeded balance; clamped to zero");
                }
                info!(event = event.event_type(), %key, "ledger row written");
                Applied::Written { clamped }
            }
        };

        Ok(applied)
    }

    /// One read of the current row, then the pure reducer.
    async fn reduce(&self, event: &LendingEvent) -> Result<Transition<LedgerRow>, ProjectionError> {
        let transition = match event {
            LendingEvent::MarketCreated(e) => {
                let current = self.store.get_market(&e.key()).await?;
                Market::created(current.as_ref(), e, &self.policy)?.map(LedgerRow::Market)
            }
            LendingEvent::Deposit(e) => {
                let current = self.store.get_lend_position(&e.key()).await?;
                LendPosition::deposited(current.as_ref(), e)?.map(LedgerRow::Lend)
            }
            LendingEvent::Withdraw(e) => {
                let current = self.store.get_lend_position(&e.key()).await?;
                LendPosition::withdrawn(current.as_ref(), e).map(LedgerRow::Lend)
            }
            LendingEvent::Borrow(e) => {
                let current = self.store.get_borrow_position(&e.key()).await?;
                BorrowPosition::borrowed(current.as_ref(), e)?.map(LedgerRow::Borrow)
            }
            LendingEvent::Repay(e) => {
                let current = self.store.get_borrow_position(&e.key()).await?;
                BorrowPosition::repaid(current.as_ref(), e).map(LedgerRow::Borrow)
            }
            LendingEvent::WithdrawCollateral(e) => {
                let current = self.store.get_borrow_position(&e.key()).await?;
                BorrowPosition::collateral_withdrawn(current.as_ref(), e).map(LedgerRow::Borrow)
            }
        };
        Ok(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use pbalend_core::{Address, Amount, PositionKey};

    use crate::read_model::InMemoryLedgerStore;

    fn usdc() -> Address {
        "0xa0b86991c6218b36c1d19d4a2e9eb0ce3606eb48".parse().unwrap()
    }

    fn weth() -> Address {
        "0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2".parse().unwrap()
    }

    fn user(b: u8) -> Address {
        Address::from_bytes([b; 20])
    }

    fn amt(v: u64) -> Amount {
        Amount::from(v)
    }

    fn engine() -> LedgerEngine<Arc<InMemoryLedgerStore>> {
        LedgerEngine::new(Arc::new(InMemoryLedgerStore::new()))
    }

    fn deposit(who: Address, amount: u64, shares: u64) -> Deposit {
        Deposit { loan_token: usdc(), collateral_token: weth(), user: who, amount: amt(amount), shares: amt(shares) }
    }

    fn withdraw(who: Address, amount: u64, shares: u64) -> Withdraw {
        Withdraw { loan_token: usdc(), collateral_token: weth(), user: who, amount: amt(amount), shares: amt(shares) }
    }

    fn borrow(who: Address, amount: u64, shares: u64, collateral: u64) -> Borrow {
        Borrow {
            loan_token: usdc(),
            collateral_token: weth(),
            user: who,
            amount: amt(amount),
            shares: amt(shares),
            collateral_amount: amt(collateral),
        }
    }

    fn repay(who: Address, shares: u64, amount: u64) -> Repay {
        Repay { loan_token: usdc(), collateral_token: weth(), user: who, shares: amt(shares), amount: amt(amount) }
    }

    fn created(rate: u64, ltv: u64) -> MarketCreated {
        MarketCreated { loan_token: usdc(), collateral_token: weth(), interest_rate: amt(rate), ltv: amt(ltv) }
    }

    #[tokio::test]
    async fn end_to_end_market_lifecycle() {
        let engine = engine();
        let (a, b) = (user(0xa), user(0xb));

        engine.apply_market_created(&created(500, 80)).await.unwrap();
        engine.apply_deposit(&deposit(a, 1000, 1000)).await.unwrap();
        engine.apply_borrow(&borrow(b, 400, 400, 1)).await.unwrap();
        engine.apply_repay(&repay(b, 400, 400)).await.unwrap();

        let store = engine.store();
        let lend = store.get_lend_position(&PositionKey::new(usdc(), weth(), a)).await.unwrap().unwrap();
        assert_eq!((lend.amount, lend.shares), (amt(1000), amt(1000)));

        let debt = store.get_borrow_position(&PositionKey::new(usdc(), weth(), b)).await.unwrap().unwrap();
        assert_eq!((debt.amount, debt.shares, debt.collateral_amount), (amt(0), amt(0), amt(1)));

        let market = store.get_market(&MarketKey::new(usdc(), weth())).await.unwrap().unwrap();
        assert_eq!((market.interest_rate, market.ltv), (amt(500), amt(80)));

        assert_eq!(
            engine.stats(),
            ProjectionStats { applied: 4, ..ProjectionStats::default() }
        );
    }

    #[tokio::test]
    async fn second_market_creation_keeps_first_values() {
        let engine = engine();
        engine.apply_market_created(&created(500, 80)).await.unwrap();
        let again = engine.apply_market_created(&created(900, 50)).await.unwrap();
        assert_eq!(again, Applied::AlreadyExists);

        let market = engine.store().get_market(&MarketKey::new(usdc(), weth())).await.unwrap().unwrap();
        assert_eq!((market.interest_rate, market.ltv), (amt(500), amt(80)));
        assert_eq!(
            engine.stats(),
            ProjectionStats { applied: 1, repeated_creations: 1, ..ProjectionStats::default() }
        );
    }

    #[tokio::test]
    async fn recreation_above_ltv_bound_is_a_no_op_not_a_rejection() {
        let engine = engine();
        let first = LendingEvent::from(created(500, 80));
        let again = LendingEvent::from(created(700, 150));

        assert!(matches!(engine.apply_at(&first, EventPosition::new(1, 0)).await.unwrap(), Applied::Written { .. }));
        assert_eq!(engine.apply_at(&again, EventPosition::new(2, 0)).await.unwrap(), Applied::AlreadyExists);

        let store = engine.store();
        let market = store.get_market(&MarketKey::new(usdc(), weth())).await.unwrap().unwrap();
        assert_eq!((market.interest_rate, market.ltv), (amt(500), amt(80)));
        assert_eq!(store.cursor(&MarketKey::new(usdc(), weth())).await.unwrap(), Some(EventPosition::new(2, 0)));

        let stats = engine.stats();
        assert_eq!(stats.rejected, 0);
        assert_eq!(stats.repeated_creations, 1);
    }

    #[tokio::test]
    async fn deposits_summing_past_one_chain_word_are_kept_exactly() {
        let engine = engine();
        let who = user(3);
        let half: Amount = format!("0x8{}", "0".repeat(63)).parse().unwrap();
        let big = Deposit { loan_token: usdc(), collateral_token: weth(), user: who, amount: half, shares: half };

        engine.apply_deposit(&big).await.unwrap();
        engine.apply_deposit(&big).await.unwrap();

        let row = engine
            .store()
            .get_lend_position(&PositionKey::new(usdc(), weth(), who))
            .await
            .unwrap()
            .unwrap();
        let two_pow_256 = "115792089237316195423570985008687907853269984665640564039457584007913129639936";
        assert_eq!(row.amount.to_string(), two_pow_256);
        assert_eq!(row.shares.to_string(), two_pow_256);
        assert_eq!(engine.stats().rejected, 0);
    }

    #[tokio::test]
    async fn borrow_and_lend_rows_never_touch_each_other() {
        let engine = engine();
        let who = user(7);
        engine.apply_deposit(&deposit(who, 10, 10)).await.unwrap();
        engine.apply_borrow(&borrow(who, 3, 3, 9)).await.unwrap();
        engine.apply_repay(&repay(who, 3, 3)).await.unwrap();

        let key = PositionKey::new(usdc(), weth(), who);
        let lend = engine.store().get_lend_position(&key).await.unwrap().unwrap();
        assert_eq!((lend.amount, lend.shares), (amt(10), amt(10)));

        engine.apply_withdraw(&withdraw(who, 10, 10)).await.unwrap();
        let debt = engine.store().get_borrow_position(&key).await.unwrap().unwrap();
        assert_eq!(debt.collateral_amount, amt(9));
    }

    #[tokio::test]
    async fn decrement_without_position_is_skipped_and_counted() {
        let engine = engine();
        let who = user(1);

        let out = engine.apply_withdraw(&withdraw(who, 40, 4)).await.unwrap();
        assert_eq!(out, Applied::Skipped);
        let out = engine
            .apply_withdraw_collateral(&WithdrawCollateral {
                loan_token: usdc(),
                collateral_token: weth(),
                user: who,
                amount: amt(1),
            })
            .await
            .unwrap();
        assert_eq!(out, Applied::Skipped);

        let key = PositionKey::new(usdc(), weth(), who);
        assert_eq!(engine.store().get_lend_position(&key).await.unwrap(), None);
        assert_eq!(engine.store().get_borrow_position(&key).await.unwrap(), None);
        assert_eq!(engine.stats().skipped_missing, 2);
    }

    #[tokio::test]
    async fn over_withdraw_clamps_and_counts_an_anomaly() {
        let engine = engine();
        let who = user(2);
        engine.apply_deposit(&deposit(who, 100, 10)).await.unwrap();

        let out = engine.apply_withdraw(&withdraw(who, 150, 10)).await.unwrap();
        assert_eq!(out, Applied::Written { clamped: vec![ClampedField::Amount] });

        let row = engine
            .store()
            .get_lend_position(&PositionKey::new(usdc(), weth(), who))
            .await
            .unwrap()
            .unwrap();
        assert!(row.amount.is_zero() && row.shares.is_zero());
        assert_eq!(engine.stats().clamp_anomalies, 1);
    }

    #[tokio::test]
    async fn malformed_market_is_rejected_and_nothing_is_written() {
        let engine = engine();
        let err = engine.apply_market_created(&created(500, 101)).await.unwrap_err();
        assert!(matches!(err, ProjectionError::Rejected(_)));
        assert!(!err.is_retryable());
        assert!(engine.store().list_markets().await.unwrap().is_empty());
        assert_eq!(engine.stats().rejected, 1);
    }

    #[tokio::test]
    async fn store_failure_keeps_pre_image_and_retry_succeeds() {
        let engine = engine();
        let who = user(3);
        engine.apply_deposit(&deposit(who, 100, 10)).await.unwrap();

        engine.store().fail_next_commits(1);
        let err = engine.apply_withdraw(&withdraw(who, 40, 4)).await.unwrap_err();
        assert!(err.is_retryable());

        let key = PositionKey::new(usdc(), weth(), who);
        let unchanged = engine.store().get_lend_position(&key).await.unwrap().unwrap();
        assert_eq!(unchanged.amount, amt(100));

        engine.apply_withdraw(&withdraw(who, 40, 4)).await.unwrap();
        let row = engine.store().get_lend_position(&key).await.unwrap().unwrap();
        assert_eq!((row.amount, row.shares), (amt(60), amt(6)));
    }

    #[tokio::test]
    async fn positioned_events_at_or_before_cursor_are_duplicates() {
        let engine = engine();
        let who = user(4);
        let ev = LendingEvent::from(deposit(who, 5, 5));

        assert!(matches!(engine.apply_at(&ev, EventPosition::new(10, 1)).await.unwrap(), Applied::Written { .. }));
        assert_eq!(engine.apply_at(&ev, EventPosition::new(10, 1)).await.unwrap(), Applied::Duplicate);
        assert_eq!(engine.apply_at(&ev, EventPosition::new(9, 7)).await.unwrap(), Applied::Duplicate);
        assert!(matches!(engine.apply_at(&ev, EventPosition::new(10, 2)).await.unwrap(), Applied::Written { .. }));

        let row = engine
            .store()
            .get_lend_position(&PositionKey::new(usdc(), weth(), who))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.amount, amt(10));
        assert_eq!(engine.stats().duplicates, 2);
    }

    #[tokio::test]
    async fn skipped_events_still_advance_the_cursor() {
        let engine = engine();
        let ev = LendingEvent::from(withdraw(user(5), 1, 1));
        assert_eq!(engine.apply_at(&ev, EventPosition::new(3, 0)).await.unwrap(), Applied::Skipped);
        assert_eq!(
            engine.store().cursor(&MarketKey::new(usdc(), weth())).await.unwrap(),
            Some(EventPosition::new(3, 0))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_deposits_on_one_key_are_not_lost() {
        let engine = Arc::new(engine());
        let who = user(6);

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.apply_deposit(&deposit(who, 1, 1)).await })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }

        let row = engine
            .store()
            .get_lend_position(&PositionKey::new(usdc(), weth(), who))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.amount, amt(64));
    }
}
