// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Benchmarks for the dispatch coordination core.
//!
//! Run with: cargo bench
//!
//! Benchmarks include:
//! - Guarded single-document mutations under contention
//! - Settlement creation throughput
//! - Credit ledger merge throughput
//! - Exclusive-batch cost (corrections, close-out)

use chrono::{NaiveDate, NaiveDateTime, Utc};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use dispatch_ledger_rs::{
    Call, CallId, CallStatus, CreditLedger, CustomerKey, DailyCloseout, DispatchStore, DriverId,
    OfficeId, PaymentMethod, RegionId, SettlementLedger,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::thread;

// =============================================================================
// Helper Functions
// =============================================================================

fn noon() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 3, 10)
        .unwrap()
        .and_hms_opt(12, 0, 0)
        .unwrap()
}

fn completed_call(store: &DispatchStore, id: &str, fare: Decimal) -> Call {
    let mut call = Call::new(
        CallId::from(id),
        RegionId::from("r1"),
        OfficeId::from("o1"),
        "Kim",
        "010-1234-5678",
        "A",
        "B",
    );
    call.status = CallStatus::Completed;
    call.assigned_driver_id = Some(DriverId::from("d1"));
    call.fare_final = Some(fare);
    call.payment_method = Some(PaymentMethod::Cash);
    call.cash_received = Some(fare);
    call.credit_amount = Some(Decimal::ZERO);
    call.completed_at = Some(Utc::now());
    store.calls.put(id, call.clone());
    call
}

// =============================================================================
// Single-Threaded Benchmarks
// =============================================================================

fn bench_guarded_mutation(c: &mut Criterion) {
    c.bench_function("guarded_mutation", |b| {
        let store = DispatchStore::new();
        completed_call(&store, "c1", dec!(10000));
        b.iter(|| {
            store
                .calls
                .update_if(black_box("c1"), |call| {
                    call.touch();
                    Ok(())
                })
                .unwrap();
        })
    });
}

fn bench_settlement_creation(c: &mut Criterion) {
    c.bench_function("settlement_creation", |b| {
        let mut i = 0u64;
        b.iter_with_setup(
            || {
                let store = DispatchStore::new();
                let ledger = SettlementLedger::new(store.clone());
                i += 1;
                let call = completed_call(&store, &format!("c{i}"), dec!(10000));
                (ledger, call)
            },
            |(ledger, call)| {
                ledger
                    .create_from_completed_call(black_box(&call), noon())
                    .unwrap();
            },
        )
    });
}

fn bench_credit_increment(c: &mut Criterion) {
    c.bench_function("credit_increment", |b| {
        let store = DispatchStore::new();
        let ledger = CreditLedger::new(store);
        let key = CustomerKey::from("kim");
        b.iter(|| {
            ledger
                .increment(black_box(&key), dec!(100), "Kim", "010", "")
                .unwrap();
        })
    });
}

fn bench_correction_batch(c: &mut Criterion) {
    c.bench_function("correction_batch", |b| {
        let mut i = 0u64;
        b.iter_with_setup(
            || {
                let store = DispatchStore::new();
                let ledger = SettlementLedger::new(store.clone());
                i += 1;
                let call = completed_call(&store, &format!("c{i}"), dec!(10000));
                let settlement = ledger.create_from_completed_call(&call, noon()).unwrap();
                (ledger, settlement.id)
            },
            |(ledger, id)| {
                ledger
                    .correct(black_box(&id), dec!(12000), PaymentMethod::Cash)
                    .unwrap();
            },
        )
    });
}

// =============================================================================
// Multi-Threaded Benchmarks
// =============================================================================

fn bench_concurrent_credit_merges(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_credit_merges");

    for num_threads in [2, 4, 8] {
        const OPS_PER_THREAD: usize = 100;
        group.throughput(Throughput::Elements((num_threads * OPS_PER_THREAD) as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(num_threads),
            &num_threads,
            |b, &num_threads| {
                b.iter(|| {
                    let store = DispatchStore::new();
                    let ledger = Arc::new(CreditLedger::new(store));
                    let mut handles = Vec::with_capacity(num_threads);
                    for _ in 0..num_threads {
                        let ledger = ledger.clone();
                        handles.push(thread::spawn(move || {
                            let key = CustomerKey::from("kim");
                            for _ in 0..OPS_PER_THREAD {
                                ledger.increment(&key, dec!(10), "Kim", "010", "").unwrap();
                            }
                        }));
                    }
                    for handle in handles {
                        handle.join().unwrap();
                    }
                })
            },
        );
    }

    group.finish();
}

fn bench_closeout_scaling(c: &mut Criterion) {
    let mut group = c.benchmark_group("closeout_scaling");

    for num_settlements in [10usize, 100, 1000] {
        group.throughput(Throughput::Elements(num_settlements as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(num_settlements),
            &num_settlements,
            |b, &num_settlements| {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .unwrap();
                b.iter_with_setup(
                    || {
                        let store = DispatchStore::new();
                        let ledger = SettlementLedger::new(store.clone());
                        for i in 0..num_settlements {
                            let call = completed_call(&store, &format!("c{i}"), dec!(1000));
                            ledger.create_from_completed_call(&call, noon()).unwrap();
                        }
                        DailyCloseout::new(store)
                    },
                    |closeout| {
                        rt.block_on(closeout.finalize(
                            &RegionId::from("r1"),
                            &OfficeId::from("o1"),
                            noon(),
                        ))
                        .unwrap();
                    },
                )
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_guarded_mutation,
    bench_settlement_creation,
    bench_credit_increment,
    bench_correction_batch,
    bench_concurrent_credit_merges,
    bench_closeout_scaling,
);
criterion_main!(benches);
