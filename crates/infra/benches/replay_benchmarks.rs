use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use pbalend_core::{Address, Amount};
use pbalend_events::{EventEnvelope, EventPosition};
use pbalend_infra::projections::LendingLedgerProjection;
use pbalend_infra::read_model::InMemoryLedgerStore;
use pbalend_lending::{Deposit, LendPosition, LendingEvent, Withdraw};
use serde_json::Value as JsonValue;
use std::sync::Arc;

fn addr(b: u8) -> Address {
    Address::from_bytes([b; 20])
}

/// Deposits and withdrawals spread over `users` lenders in `markets` markets.
fn envelopes(count: usize, markets: u8, users: u8) -> Vec<EventEnvelope<JsonValue>> {
    (0..count)
        .map(|i| {
            let loan = addr(1);
            let collateral = addr(10 + (i % markets as usize) as u8);
            let user = addr(100 + (i % users as usize) as u8);
            let event = if i % 4 == 3 {
                LendingEvent::from(Withdraw {
                    loan_token: loan,
                    collateral_token: collateral,
                    user,
                    amount: Amount::from(3u64),
                    shares: Amount::from(3u64),
                })
            } else {
                LendingEvent::from(Deposit {
                    loan_token: loan,
                    collateral_token: collateral,
                    user,
                    amount: Amount::from(10u64),
                    shares: Amount::from(10u64),
                })
            };
            let payload = serde_json::to_value(event).unwrap();
            EventEnvelope::new(EventPosition::new(i as u64 / 8, i as u64 % 8), payload)
        })
        .collect()
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread().build().unwrap()
}

fn bench_apply_envelope_latency(c: &mut Criterion) {
    let mut group = c.benchmark_group("apply_envelope_latency");
    group.sample_size(1000);
    let rt = runtime();

    group.bench_function("deposit_fresh_position", |b| {
        let projection = LendingLedgerProjection::new(Arc::new(InMemoryLedgerStore::new()));
        let mut next = 0u64;
        b.iter(|| {
            next += 1;
            let env = EventEnvelope::new(
                EventPosition::new(next, 0),
                serde_json::to_value(LendingEvent::from(Deposit {
                    loan_token: addr(1),
                    collateral_token: addr(2),
                    user: Address::from_bytes({
                        let mut raw = [0u8; 20];
                        raw[12..].copy_from_slice(&next.to_be_bytes());
                        raw
                    }),
                    amount: black_box(Amount::from(10u64)),
                    shares: Amount::from(10u64),
                }))
                .unwrap(),
            );
            rt.block_on(projection.apply_envelope(&env)).unwrap();
        });
    });

    group.bench_function("duplicate_envelope", |b| {
        let projection = LendingLedgerProjection::new(Arc::new(InMemoryLedgerStore::new()));
        let env = envelopes(1, 1, 1).remove(0);
        rt.block_on(projection.apply_envelope(&env)).unwrap();
        b.iter(|| rt.block_on(projection.apply_envelope(black_box(&env))).unwrap());
    });

    group.finish();
}

fn bench_reducer_only(c: &mut Criterion) {
    let mut group = c.benchmark_group("reducer");
    let open = LendPosition {
        loan_token: addr(1),
        collateral_token: addr(2),
        user: addr(3),
        amount: Amount::from(1_000_000u64),
        shares: Amount::from(1_000_000u64),
    };
    let withdraw = Withdraw {
        loan_token: addr(1),
        collateral_token: addr(2),
        user: addr(3),
        amount: Amount::from(7u64),
        shares: Amount::from(7u64),
    };

    group.bench_function("withdraw_clamped_sub", |b| {
        b.iter(|| LendPosition::withdrawn(black_box(Some(&open)), black_box(&withdraw)))
    });
    group.finish();
}

fn bench_rebuild_speed(c: &mut Criterion) {
    let mut group = c.benchmark_group("ledger_rebuild");
    let rt = runtime();

    for count in [1_000usize, 10_000] {
        let all = envelopes(count, 4, 50);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &all, |b, all| {
            let projection = LendingLedgerProjection::new(Arc::new(InMemoryLedgerStore::new()));
            b.iter(|| {
                rt.block_on(projection.rebuild_from_scratch(black_box(all.clone())))
                    .unwrap();
            });
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_apply_envelope_latency,
    bench_reducer_only,
    bench_rebuild_speed
);
criterion_main!(benches);
