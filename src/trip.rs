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

//! Trip lifecycle state machine.
//!
//! One guarded-transition function per edge: accept, start, complete,
//! confirm settlement. Each re-reads the call inside its conditional
//! transaction, checks the expected status and the owning driver, and fails
//! closed with [`DispatchError::Conflict`] on any mismatch. There is no
//! reverse edge anywhere: a call never moves backwards.
//!
//! The follow-up after settlement confirmation tolerates the backend
//! trigger's lag: it polls for the settlement id with a fixed budget and
//! gives up cleanly, leaving the settlement PENDING for manual
//! reconciliation.

use crate::base::{CallId, SessionCtx, SettlementId};
use crate::call::{Call, CallStatus, PaymentMethod};
use crate::credit::{CreditLedger, derive_customer_key};
use crate::driver::DriverState;
use crate::error::DispatchError;
use crate::retry::{RetryOutcome, poll_until};
use crate::settlement::SettlementLedger;
use crate::store::DispatchStore;
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Poll budget for the asynchronous settlement-id attachment.
const RECONCILE_ATTEMPTS: u32 = 5;
const RECONCILE_BACKOFF: Duration = Duration::from_millis(200);

/// How settlement confirmation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettleOutcome {
    /// The backend attached the settlement id in time and it is now SETTLED.
    Reconciled(SettlementId),
    /// The poll budget ran out; the settlement stays PENDING for manual
    /// reconciliation. Not an error.
    PendingReconciliation,
}

pub struct TripLifecycle {
    store: Arc<DispatchStore>,
    settlements: Arc<SettlementLedger>,
    credits: Arc<CreditLedger>,
}

impl TripLifecycle {
    pub fn new(
        store: Arc<DispatchStore>,
        settlements: Arc<SettlementLedger>,
        credits: Arc<CreditLedger>,
    ) -> Self {
        Self {
            store,
            settlements,
            credits,
        }
    }

    /// ASSIGNED → ACCEPTED. The driver moves to PREPARING.
    ///
    /// Accepting claims the driver: a driver already occupied by another
    /// call gets [`DispatchError::Conflict`], so holding several ASSIGNED
    /// calls never turns into working two trips at once.
    pub async fn accept(&self, call_id: &CallId, session: &SessionCtx) -> Result<Call, DispatchError> {
        let call = self.transition_with_driver(
            call_id,
            session,
            CallStatus::Assigned,
            DriverState::Preparing,
            |call| {
                call.status = CallStatus::Accepted;
                Ok(())
            },
        )?;
        info!(call = %call.id, driver = %session.driver_id, "call accepted");
        Ok(call)
    }

    /// ACCEPTED → IN_PROGRESS. Writes the as-set trip fields; the driver
    /// moves to ON_TRIP.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Validation`] for a non-positive fare.
    #[allow(clippy::too_many_arguments)]
    pub async fn start(
        &self,
        call_id: &CallId,
        session: &SessionCtx,
        departure: &str,
        destination: &str,
        waypoints: Vec<String>,
        fare: Decimal,
    ) -> Result<Call, DispatchError> {
        if fare <= Decimal::ZERO {
            return Err(DispatchError::Validation("fare must be positive".into()));
        }
        if departure.trim().is_empty() || destination.trim().is_empty() {
            return Err(DispatchError::Validation(
                "departure and destination are required".into(),
            ));
        }

        let call = self.transition_with_driver(
            call_id,
            session,
            CallStatus::Accepted,
            DriverState::OnTrip,
            |call| {
                call.departure_set = Some(departure.to_string());
                call.destination_set = Some(destination.to_string());
                call.waypoints_set = waypoints.clone();
                call.fare_set = Some(fare);
                call.status = CallStatus::InProgress;
                Ok(())
            },
        )?;
        info!(call = %call.id, driver = %session.driver_id, %fare, "trip started");
        Ok(call)
    }

    /// IN_PROGRESS → AWAITING_SETTLEMENT. The driver stays occupied until
    /// the settlement is confirmed.
    pub async fn complete(&self, call_id: &CallId, session: &SessionCtx) -> Result<Call, DispatchError> {
        let call = self.transition(call_id, session, CallStatus::InProgress, |call| {
            call.status = CallStatus::AwaitingSettlement;
            Ok(())
        })?;
        info!(call = %call.id, driver = %session.driver_id, "trip completed, awaiting settlement");
        Ok(call)
    }

    /// AWAITING_SETTLEMENT → COMPLETED. Writes the completion fields, frees
    /// the driver, credits any deferred portion to the customer's account,
    /// then best-effort reconciles with the backend-created settlement.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Validation`] for a non-positive final fare or a cash
    /// amount exceeding it. Guard failures surface as
    /// [`DispatchError::Conflict`].
    pub async fn confirm_settlement(
        &self,
        call_id: &CallId,
        session: &SessionCtx,
        payment_method: PaymentMethod,
        cash_amount: Decimal,
        fare_final: Decimal,
        trip_summary: &str,
    ) -> Result<SettleOutcome, DispatchError> {
        if fare_final <= Decimal::ZERO {
            return Err(DispatchError::Validation(
                "final fare must be positive".into(),
            ));
        }
        if cash_amount < Decimal::ZERO || cash_amount > fare_final {
            return Err(DispatchError::Validation(
                "cash amount must be between zero and the final fare".into(),
            ));
        }

        // Derive the received split from the method. Cash settles fully in
        // cash; card settles out of band; credit methods defer the rest.
        let cash_received = match payment_method {
            PaymentMethod::Cash => fare_final,
            PaymentMethod::Card | PaymentMethod::Credit => Decimal::ZERO,
            PaymentMethod::CashAndCredit => cash_amount,
        };
        let credit_amount = if payment_method.has_deferred_portion() {
            fare_final - cash_received
        } else {
            Decimal::ZERO
        };

        let call = self.transition_with_driver(
            call_id,
            session,
            CallStatus::AwaitingSettlement,
            DriverState::Waiting,
            |call| {
                call.payment_method = Some(payment_method);
                call.fare_final = Some(fare_final);
                call.trip_summary_final = Some(trip_summary.to_string());
                call.cash_received = Some(cash_received);
                call.credit_amount = Some(credit_amount);
                call.status = CallStatus::Completed;
                call.completed_at = Some(Utc::now());
                Ok(())
            },
        )?;
        info!(call = %call.id, %fare_final, method = %payment_method, "settlement confirmed");

        if credit_amount > Decimal::ZERO {
            let key = derive_customer_key(&call.customer_name, &call.customer_phone);
            self.credits.increment(
                &key,
                credit_amount,
                &call.customer_name,
                &call.customer_phone,
                &format!("call {}", call.id),
            )?;
        }

        // The backend trigger attaches the settlement id asynchronously.
        // Poll with a fixed budget and give up cleanly: a PENDING settlement
        // is reconciled manually, it is not a failure of this trip.
        let store = self.store.clone();
        let poll_id = call.id.clone();
        let outcome = poll_until(RECONCILE_ATTEMPTS, RECONCILE_BACKOFF, || {
            let store = store.clone();
            let call_id = poll_id.clone();
            async move { store.calls.get(call_id.as_str()).and_then(|c| c.settlement_id) }
        })
        .await;

        match outcome {
            RetryOutcome::Done(settlement_id) => {
                self.settlements.mark_settled(&settlement_id)?;
                Ok(SettleOutcome::Reconciled(settlement_id))
            }
            RetryOutcome::GaveUp { attempts } => {
                warn!(call = %call.id, attempts, "settlement id never materialized, left PENDING");
                Ok(SettleOutcome::PendingReconciliation)
            }
        }
    }

    /// Shared guarded transition: expected status and owning driver are
    /// re-validated inside the call's conditional transaction.
    fn transition<F>(
        &self,
        call_id: &CallId,
        session: &SessionCtx,
        expected: CallStatus,
        apply: F,
    ) -> Result<Call, DispatchError>
    where
        F: FnOnce(&mut Call) -> Result<(), DispatchError>,
    {
        self.store.calls.update_if(call_id.as_str(), |call| {
            Self::guard(call, session, expected)?;
            apply(call)?;
            call.touch();
            call.assert_invariants();
            Ok(())
        })
    }

    /// Call edge plus driver write in one exclusive batch. The driver
    /// document is validated before the call commits, so the two never
    /// diverge. Moving to PREPARING claims the driver; a driver already
    /// occupied by a trip cannot be claimed again.
    fn transition_with_driver<F>(
        &self,
        call_id: &CallId,
        session: &SessionCtx,
        expected: CallStatus,
        driver_state: DriverState,
        apply: F,
    ) -> Result<Call, DispatchError>
    where
        F: FnOnce(&mut Call) -> Result<(), DispatchError>,
    {
        self.store.exclusive(|| {
            let driver = self
                .store
                .drivers
                .get_ungated(session.driver_id.as_str())
                .ok_or(DispatchError::NotFound)?;
            if driver_state == DriverState::Preparing && driver.state.is_occupied() {
                return Err(DispatchError::Conflict);
            }

            let call = self.store.calls.update_if_ungated(call_id.as_str(), |call| {
                Self::guard(call, session, expected)?;
                apply(call)?;
                call.touch();
                call.assert_invariants();
                Ok(())
            })?;

            self.store
                .drivers
                .update_if_ungated(session.driver_id.as_str(), |driver| {
                    driver.state = driver_state;
                    driver.updated_at = Utc::now();
                    Ok(())
                })?;
            Ok(call)
        })
    }

    fn guard(call: &Call, session: &SessionCtx, expected: CallStatus) -> Result<(), DispatchError> {
        if call.status != expected {
            return Err(DispatchError::Conflict);
        }
        if call.assigned_driver_id.as_ref() != Some(&session.driver_id) {
            return Err(DispatchError::Conflict);
        }
        Ok(())
    }
}
