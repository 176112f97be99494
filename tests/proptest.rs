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

//! Property-based tests for the dispatch ledgers.
//!
//! These tests verify invariants that should hold for any sequence of
//! valid operations.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Utc};
use dispatch_ledger_rs::{
    Call, CallId, CallStatus, CreditLedger, CustomerKey, DispatchStore, DriverId, OfficeId,
    PaymentMethod, RegionId, SettlementLedger, SettlementStatus, derive_customer_key, work_date,
};
use proptest::prelude::*;
use rust_decimal::Decimal;

// =============================================================================
// Arbitrary Strategies
// =============================================================================

/// Generate a positive fare (1 to 100,000 whole units).
fn arb_fare() -> impl Strategy<Value = Decimal> {
    (1i64..=100_000i64).prop_map(Decimal::from)
}

fn arb_payment_method() -> impl Strategy<Value = PaymentMethod> {
    prop_oneof![
        Just(PaymentMethod::Cash),
        Just(PaymentMethod::Card),
        Just(PaymentMethod::Credit),
        Just(PaymentMethod::CashAndCredit),
    ]
}

fn arb_local_datetime() -> impl Strategy<Value = NaiveDateTime> {
    (0i64..=3_000i64, 0u32..86_400u32).prop_map(|(days, secs)| {
        let date = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap() + chrono::Days::new(days as u64);
        date.and_time(NaiveTime::from_num_seconds_from_midnight_opt(secs, 0).unwrap())
    })
}

fn completed_call(store: &DispatchStore, id: &str, fare: Decimal, method: PaymentMethod) -> Call {
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
    call.payment_method = Some(method);
    call.cash_received = Some(match method {
        PaymentMethod::Cash => fare,
        _ => Decimal::ZERO,
    });
    call.credit_amount = Some(if method.has_deferred_portion() {
        fare
    } else {
        Decimal::ZERO
    });
    call.completed_at = Some(Utc::now());
    store.calls.put(id, call.clone());
    call
}

// =============================================================================
// Credit Ledger Invariants
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// The balance is always the sum of credits minus payments actually
    /// applied, and never negative.
    #[test]
    fn credit_balance_never_negative(
        ops in prop::collection::vec((any::<bool>(), arb_fare()), 1..40),
    ) {
        let store = DispatchStore::new();
        let ledger = CreditLedger::new(store);
        let key = CustomerKey::from("kim");

        for (is_credit, amount) in ops {
            if is_credit {
                ledger.increment(&key, amount, "Kim", "010", "").unwrap();
            } else {
                // NotFound when the account closed itself is expected.
                let _ = ledger.decrement(&key, amount);
            }
            if let Some(account) = ledger.get(&key) {
                prop_assert!(account.total_owed > Decimal::ZERO);
            }
        }
    }

    /// Increments accumulate exactly when no payment intervenes.
    #[test]
    fn credit_increments_sum(
        amounts in prop::collection::vec(arb_fare(), 1..20),
    ) {
        let store = DispatchStore::new();
        let ledger = CreditLedger::new(store);
        let key = CustomerKey::from("kim");

        let mut expected = Decimal::ZERO;
        for amount in &amounts {
            ledger.increment(&key, *amount, "Kim", "010", "").unwrap();
            expected += *amount;
        }

        prop_assert_eq!(ledger.get(&key).unwrap().total_owed, expected);
    }

    /// The derived customer key is deterministic and never empty.
    #[test]
    fn customer_key_deterministic_for_named_customers(
        name in "[a-zA-Z][a-zA-Z ]{0,30}",
        phone in "[0-9\\-]{0,15}",
    ) {
        let a = derive_customer_key(&name, &phone);
        let b = derive_customer_key(&name, &phone);
        prop_assert_eq!(&a, &b);
        prop_assert!(!a.as_str().is_empty());
    }
}

// =============================================================================
// Work Date Invariants
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(1000))]

    /// A timestamp before 06:00 maps to the previous calendar day, any other
    /// to its own; the boundary never produces a gap or an overlap.
    #[test]
    fn work_date_respects_six_am_boundary(at in arb_local_datetime()) {
        let d = work_date(at);
        let six = NaiveTime::from_hms_opt(6, 0, 0).unwrap();
        if at.time() < six {
            prop_assert_eq!(d, at.date().pred_opt().unwrap());
        } else {
            prop_assert_eq!(d, at.date());
        }
    }
}

// =============================================================================
// Settlement Ledger Invariants
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    /// Any chain of corrections leaves exactly one non-CORRECTED settlement
    /// per call, and its cash/credit split always sums to its fare for
    /// cash-based methods.
    #[test]
    fn one_active_settlement_per_call(
        corrections in prop::collection::vec((arb_fare(), arb_payment_method()), 0..8),
        initial_fare in arb_fare(),
    ) {
        let store = DispatchStore::new();
        let ledger = SettlementLedger::new(store.clone());
        let call = completed_call(&store, "c1", initial_fare, PaymentMethod::Cash);

        let mut active_id = ledger
            .create_from_completed_call(&call, NaiveDate::from_ymd_opt(2025, 3, 10).unwrap().and_hms_opt(12, 0, 0).unwrap())
            .unwrap()
            .id;

        for (fare, method) in corrections {
            active_id = ledger.correct(&active_id, fare, method).unwrap().id;
        }

        let active = store
            .settlements
            .filter(|s| s.settlement_status != SettlementStatus::Corrected);
        prop_assert_eq!(active.len(), 1);
        prop_assert_eq!(&active[0].id, &active_id);

        // The split never exceeds the fare and covers it fully for cash and
        // credit settlements; card money moves out of band.
        for s in store.settlements.filter(|_| true) {
            prop_assert!(s.cash_amount >= Decimal::ZERO);
            prop_assert!(s.credit_amount >= Decimal::ZERO);
            prop_assert!(s.cash_amount + s.credit_amount <= s.fare);
            if s.payment_method != PaymentMethod::Card {
                prop_assert_eq!(s.cash_amount + s.credit_amount, s.fare);
            }
        }
    }

    /// Duplicate creations collapse to one settlement no matter how many
    /// times the trigger fires.
    #[test]
    fn settlement_creation_is_idempotent(times in 1usize..10, fare in arb_fare()) {
        let store = DispatchStore::new();
        let ledger = SettlementLedger::new(store.clone());
        let call = completed_call(&store, "c1", fare, PaymentMethod::Cash);
        let at = NaiveDate::from_ymd_opt(2025, 3, 10).unwrap().and_hms_opt(12, 0, 0).unwrap();

        let first = ledger.create_from_completed_call(&call, at).unwrap();
        for _ in 1..times {
            let again = ledger.create_from_completed_call(&call, at).unwrap();
            prop_assert_eq!(&again.id, &first.id);
        }
        prop_assert_eq!(store.settlements.len(), 1);
    }
}
