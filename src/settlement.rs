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

//! Settlement ledger.
//!
//! A [`Settlement`] is the financial record derived from a completed call.
//! The ledger is append-only: a correction flips the original row to
//! CORRECTED and inserts a replacement, in one atomic batch. Rows are never
//! mutated destructively and never deleted; daily finalization only flips
//! `is_finalized`.
//!
//! At most one non-CORRECTED settlement exists per call at any time. That
//! holds even under duplicate trigger delivery: creation runs as an
//! exclusive batch, and a dedup index keyed by call id is written in the
//! same batch as the row it points at.

use crate::base::{CallId, DriverId, OfficeId, RegionId, SettlementId};
use crate::call::{Call, CallStatus, PaymentMethod};
use crate::error::DispatchError;
use crate::store::DispatchStore;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Trips ending before 06:00 local time belong to the previous business day.
const DAY_BOUNDARY: NaiveTime = match NaiveTime::from_hms_opt(6, 0, 0) {
    Some(t) => t,
    None => unreachable!(),
};

/// Maps a local timestamp to its business day under the 6am boundary rule.
pub fn work_date(at_local: NaiveDateTime) -> NaiveDate {
    if at_local.time() < DAY_BOUNDARY {
        at_local.date().pred_opt().unwrap_or(at_local.date())
    } else {
        at_local.date()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementStatus {
    Pending,
    Settled,
    Corrected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settlement {
    pub id: SettlementId,
    pub call_id: CallId,
    pub driver_id: DriverId,
    pub region_id: RegionId,
    pub office_id: OfficeId,
    pub fare: Decimal,
    pub payment_method: PaymentMethod,
    pub cash_amount: Decimal,
    pub credit_amount: Decimal,
    pub settlement_status: SettlementStatus,
    pub is_finalized: bool,
    /// Business day bucket, `YYYY-MM-DD`.
    pub work_date: String,
    pub created_at: DateTime<Utc>,
    pub corrected_at: Option<DateTime<Utc>>,
}

/// One active (non-CORRECTED) settlement per call. Consulted and updated
/// only under the store's exclusive gate, so a reservation is never visible
/// before the settlement row it points at.
#[derive(Debug, Default)]
struct ActiveIndex {
    by_call: DashMap<String, SettlementId>,
}

impl ActiveIndex {
    fn get(&self, call_id: &CallId) -> Option<SettlementId> {
        self.by_call.get(call_id.as_str()).map(|id| id.clone())
    }

    /// Points the call at its (new or corrected) settlement.
    fn replace(&self, call_id: &CallId, settlement_id: &SettlementId) {
        self.by_call
            .insert(call_id.as_str().to_string(), settlement_id.clone());
    }
}

/// Settlement ledger operations and query views.
pub struct SettlementLedger {
    store: Arc<DispatchStore>,
    active: ActiveIndex,
}

impl SettlementLedger {
    pub fn new(store: Arc<DispatchStore>) -> Self {
        Self {
            store,
            active: ActiveIndex::default(),
        }
    }

    /// Derives a settlement from a COMPLETED call and writes its id back
    /// onto the call. Invoked by the backend trigger.
    ///
    /// Idempotent per call: a duplicate invocation returns the settlement
    /// that already exists instead of creating a second one.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Validation`] if the call is not COMPLETED or lacks
    /// its completion fields.
    pub fn create_from_completed_call(
        &self,
        call: &Call,
        at_local: NaiveDateTime,
    ) -> Result<Settlement, DispatchError> {
        if call.status != CallStatus::Completed {
            return Err(DispatchError::Validation(format!(
                "settlement requires a COMPLETED call, got {}",
                call.status
            )));
        }
        let driver_id = call
            .assigned_driver_id
            .clone()
            .ok_or_else(|| DispatchError::Validation("completed call has no driver".into()))?;
        let fare = call
            .fare_final
            .ok_or_else(|| DispatchError::Validation("completed call has no final fare".into()))?;
        let payment_method = call
            .payment_method
            .ok_or_else(|| DispatchError::Validation("completed call has no payment method".into()))?;
        let cash_amount = call.cash_received.unwrap_or(Decimal::ZERO);
        let credit_amount = call.credit_amount.unwrap_or(Decimal::ZERO);

        let settlement_id = SettlementId::generate();
        let (settlement, created) = self.store.exclusive(|| {
            // Index and row are written together under the gate: a duplicate
            // that loses here always finds the winner's row already present.
            if let Some(existing) = self.active.get(&call.id) {
                debug!(call = %call.id, settlement = %existing, "settlement already exists, duplicate trigger ignored");
                return self
                    .store
                    .settlements
                    .get_ungated(existing.as_str())
                    .ok_or(DispatchError::NotFound)
                    .map(|settlement| (settlement, false));
            }

            let settlement = Settlement {
                id: settlement_id.clone(),
                call_id: call.id.clone(),
                driver_id: driver_id.clone(),
                region_id: call.region_id.clone(),
                office_id: call.office_id.clone(),
                fare,
                payment_method,
                cash_amount,
                credit_amount,
                settlement_status: SettlementStatus::Pending,
                is_finalized: false,
                work_date: work_date(at_local).to_string(),
                created_at: Utc::now(),
                corrected_at: None,
            };
            self.store
                .settlements
                .insert_new_ungated(settlement_id.as_str(), settlement.clone())?;
            self.active.replace(&call.id, &settlement_id);

            // Attach the back-reference. The call may have vanished or
            // already carry an id from a racing trigger; neither undoes the
            // settlement.
            let _ = self.store.calls.update_if_ungated(call.id.as_str(), |c| {
                if c.settlement_id.is_none() {
                    c.settlement_id = Some(settlement_id.clone());
                    c.touch();
                }
                Ok(())
            });

            Ok((settlement, true))
        })?;

        if created {
            info!(settlement = %settlement.id, call = %settlement.call_id, work_date = %settlement.work_date, "settlement created");
        }
        Ok(settlement)
    }

    /// Flips a PENDING settlement to SETTLED. Idempotent: settlements that
    /// are already SETTLED or CORRECTED are left alone, so the retry path in
    /// the trip state machine may invoke this more than once.
    pub fn mark_settled(&self, id: &SettlementId) -> Result<(), DispatchError> {
        self.store.settlements.update_if(id.as_str(), |settlement| {
            if settlement.settlement_status == SettlementStatus::Pending {
                settlement.settlement_status = SettlementStatus::Settled;
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Corrects a settlement: flips the original to CORRECTED and appends a
    /// replacement row carrying the corrected values, already SETTLED.
    ///
    /// Both writes commit atomically; a failure leaves zero partial records
    /// and the operation is safely retryable.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::NotFound`] if the original does not exist.
    /// - [`DispatchError::Conflict`] if the original is already CORRECTED.
    /// - [`DispatchError::Validation`] for a non-positive corrected fare.
    pub fn correct(
        &self,
        original_id: &SettlementId,
        new_fare: Decimal,
        new_payment_method: PaymentMethod,
    ) -> Result<Settlement, DispatchError> {
        if new_fare <= Decimal::ZERO {
            return Err(DispatchError::Validation(
                "corrected fare must be positive".into(),
            ));
        }

        let corrected = self.store.exclusive(|| {
            // Validate everything before the first write.
            let original = self
                .store
                .settlements
                .get_ungated(original_id.as_str())
                .ok_or(DispatchError::NotFound)?;
            if original.settlement_status == SettlementStatus::Corrected {
                return Err(DispatchError::Conflict);
            }
            if original.is_finalized {
                return Err(DispatchError::Conflict);
            }

            // The corrected cash/credit split: cash methods settle fully in
            // cash, card fully out of band, credit methods keep the original
            // cash portion and defer the rest.
            let (cash_amount, credit_amount) = match new_payment_method {
                PaymentMethod::Cash => (new_fare, Decimal::ZERO),
                PaymentMethod::Card => (Decimal::ZERO, Decimal::ZERO),
                PaymentMethod::Credit => (Decimal::ZERO, new_fare),
                PaymentMethod::CashAndCredit => {
                    let cash = original.cash_amount.min(new_fare);
                    (cash, new_fare - cash)
                }
            };

            let replacement = Settlement {
                id: SettlementId::generate(),
                call_id: original.call_id.clone(),
                driver_id: original.driver_id.clone(),
                region_id: original.region_id.clone(),
                office_id: original.office_id.clone(),
                fare: new_fare,
                payment_method: new_payment_method,
                cash_amount,
                credit_amount,
                settlement_status: SettlementStatus::Settled,
                is_finalized: false,
                work_date: original.work_date.clone(),
                created_at: Utc::now(),
                corrected_at: None,
            };

            self.store
                .settlements
                .update_if_ungated(original_id.as_str(), |settlement| {
                    settlement.settlement_status = SettlementStatus::Corrected;
                    settlement.corrected_at = Some(Utc::now());
                    Ok(())
                })?;
            self.store
                .settlements
                .insert_new_ungated(replacement.id.as_str(), replacement.clone())?;
            self.active.replace(&replacement.call_id, &replacement.id);

            Ok(replacement)
        })?;

        info!(original = %original_id, replacement = %corrected.id, fare = %corrected.fare, "settlement corrected");
        Ok(corrected)
    }

    /// PENDING settlements, newest first, capped at `limit`.
    pub fn pending(&self, limit: usize) -> Vec<Settlement> {
        let mut rows = self
            .store
            .settlements
            .filter(|s| s.settlement_status == SettlementStatus::Pending);
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit);
        rows
    }

    /// All unfinalized settlements, newest first.
    pub fn open(&self) -> Vec<Settlement> {
        let mut rows = self.store.settlements.filter(|s| !s.is_finalized);
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows
    }

    /// Unfinalized settlements grouped by driver, drivers in id order and
    /// each driver's rows newest first.
    pub fn open_by_driver(&self) -> BTreeMap<DriverId, Vec<Settlement>> {
        let mut grouped: BTreeMap<DriverId, Vec<Settlement>> = BTreeMap::new();
        for settlement in self.open() {
            grouped
                .entry(settlement.driver_id.clone())
                .or_default()
                .push(settlement);
        }
        grouped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn local(date: (i32, u32, u32), time: (u32, u32)) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(date.0, date.1, date.2)
            .unwrap()
            .and_hms_opt(time.0, time.1, 0)
            .unwrap()
    }

    #[test]
    fn work_date_before_six_belongs_to_previous_day() {
        let d = work_date(local((2025, 3, 10), (5, 59)));
        assert_eq!(d, NaiveDate::from_ymd_opt(2025, 3, 9).unwrap());
    }

    #[test]
    fn work_date_at_six_belongs_to_same_day() {
        let d = work_date(local((2025, 3, 10), (6, 0)));
        assert_eq!(d, NaiveDate::from_ymd_opt(2025, 3, 10).unwrap());
    }

    #[test]
    fn work_date_midnight_belongs_to_previous_day() {
        let d = work_date(local((2025, 3, 10), (0, 0)));
        assert_eq!(d, NaiveDate::from_ymd_opt(2025, 3, 9).unwrap());
    }

    #[test]
    fn work_date_evening_belongs_to_same_day() {
        let d = work_date(local((2025, 3, 10), (23, 30)));
        assert_eq!(d, NaiveDate::from_ymd_opt(2025, 3, 10).unwrap());
    }

    #[test]
    fn active_index_tracks_the_replacement() {
        let index = ActiveIndex::default();
        let call = CallId::from("c1");

        assert_eq!(index.get(&call), None);
        index.replace(&call, &SettlementId::from("s1"));
        assert_eq!(index.get(&call), Some(SettlementId::from("s1")));
        index.replace(&call, &SettlementId::from("s2"));
        assert_eq!(index.get(&call), Some(SettlementId::from("s2")));
    }
}
