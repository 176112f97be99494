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

//! Dispatch coordinator: race-safe assignment and shared-call claiming.
//!
//! Assignment conflicts are expected, not fatal. Every operation
//! re-validates its precondition against the live document inside the
//! store's guarded mutation; a caller holding a stale snapshot gets
//! [`DispatchError::Conflict`] (or [`DispatchError::AlreadyClaimed`]) and
//! recovers by re-reading the live list, never by blind retry.

use crate::base::{CallId, OfficeId, SessionCtx, SharedCallId};
use crate::call::{Call, CallStatus, SharedCall, SharedCallStatus};
use crate::driver::DriverState;
use crate::error::DispatchError;
use crate::notify::{NotificationEvent, Notifier, send_best_effort};
use crate::store::DispatchStore;
use std::sync::Arc;
use tracing::info;

pub struct Dispatcher {
    store: Arc<DispatchStore>,
    notifier: Arc<dyn Notifier>,
}

impl Dispatcher {
    pub fn new(store: Arc<DispatchStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self { store, notifier }
    }

    /// Opens a new call in WAITING.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Conflict`] if a call with this id already exists.
    pub async fn open_call(&self, call: Call) -> Result<(), DispatchError> {
        call.assert_invariants();
        self.store.calls.insert_new(call.id.as_str(), call.clone())?;
        info!(call = %call.id, office = %call.office_id, "call opened");
        Ok(())
    }

    /// Broadcasts a shared call for any waiting driver in the office.
    pub async fn post_shared(&self, shared: SharedCall) -> Result<(), DispatchError> {
        self.store
            .shared_calls
            .insert_new(shared.id.as_str(), shared.clone())?;
        info!(shared_call = %shared.id, office = %shared.office_id, "shared call posted");
        Ok(())
    }

    /// Assigns a WAITING call to a WAITING driver.
    ///
    /// Both preconditions are re-validated inside one exclusive batch: of
    /// two concurrent assigns on the same call, exactly one succeeds and
    /// the other gets [`DispatchError::Conflict`] with the call untouched.
    /// On success a CALL_ASSIGNED notification is fired at the driver,
    /// fire-and-forget.
    pub async fn assign(&self, call_id: &CallId, session: &SessionCtx) -> Result<Call, DispatchError> {
        let driver_id = session.driver_id.clone();
        let (call, push_token) = self.store.exclusive(|| {
            let driver = self
                .store
                .drivers
                .get_ungated(driver_id.as_str())
                .ok_or(DispatchError::NotFound)?;
            if driver.state != DriverState::Waiting {
                return Err(DispatchError::Conflict);
            }

            let call = self.store.calls.update_if_ungated(call_id.as_str(), |call| {
                if call.status != CallStatus::Waiting {
                    return Err(DispatchError::Conflict);
                }
                call.status = CallStatus::Assigned;
                call.assigned_driver_id = Some(driver_id.clone());
                call.touch();
                call.assert_invariants();
                Ok(())
            })?;
            Ok((call, driver.push_token))
        })?;

        info!(call = %call.id, driver = %session.driver_id, "call assigned");
        send_best_effort(
            self.notifier.as_ref(),
            NotificationEvent::CallAssigned {
                call_id: call.id.clone(),
                driver_id: session.driver_id.clone(),
            },
            push_token.as_deref(),
        )
        .await;

        Ok(call)
    }

    /// Claims a shared call for the session's driver: marks it CLAIMED and
    /// materializes the Call, atomically. First writer wins.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::AlreadyClaimed`] if another driver won the race;
    ///   no Call is created for the loser.
    /// - [`DispatchError::Conflict`] if the shared call was cancelled or the
    ///   driver is not WAITING.
    pub async fn claim_shared(
        &self,
        shared_call_id: &SharedCallId,
        session: &SessionCtx,
    ) -> Result<Call, DispatchError> {
        let call = self.store.exclusive(|| {
            let shared = self
                .store
                .shared_calls
                .get_ungated(shared_call_id.as_str())
                .ok_or(DispatchError::NotFound)?;
            match shared.status {
                SharedCallStatus::Open => {}
                SharedCallStatus::Claimed => return Err(DispatchError::AlreadyClaimed),
                SharedCallStatus::Cancelled => return Err(DispatchError::Conflict),
            }
            let driver = self
                .store
                .drivers
                .get_ungated(session.driver_id.as_str())
                .ok_or(DispatchError::NotFound)?;
            if driver.state != DriverState::Waiting {
                return Err(DispatchError::Conflict);
            }

            let call = shared.materialize(CallId::generate(), session.driver_id.clone());
            self.store
                .shared_calls
                .update_if_ungated(shared_call_id.as_str(), |shared| {
                    shared.status = SharedCallStatus::Claimed;
                    shared.claimed_by = Some(session.driver_id.clone());
                    Ok(())
                })?;
            self.store
                .calls
                .insert_new_ungated(call.id.as_str(), call.clone())?;
            Ok(call)
        })?;

        info!(shared_call = %shared_call_id, call = %call.id, driver = %session.driver_id, "shared call claimed");
        Ok(call)
    }

    /// Releases an unclaimed shared call back out of the pool.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Conflict`] if it was already claimed or cancelled.
    pub async fn cancel_shared(&self, shared_call_id: &SharedCallId) -> Result<(), DispatchError> {
        self.store
            .shared_calls
            .update_if(shared_call_id.as_str(), |shared| {
                if shared.status != SharedCallStatus::Open {
                    return Err(DispatchError::Conflict);
                }
                shared.status = SharedCallStatus::Cancelled;
                Ok(())
            })?;
        info!(shared_call = %shared_call_id, "shared call cancelled");
        Ok(())
    }

    /// Cancels a call that has not been accepted yet (WAITING or ASSIGNED).
    ///
    /// Cancelling an ASSIGNED call releases the driver and notifies them;
    /// past acceptance the trip must run to completion.
    pub async fn cancel_call(&self, call_id: &CallId) -> Result<(), DispatchError> {
        let mut released_driver = None;
        let call = self.store.calls.update_if(call_id.as_str(), |call| {
            match call.status {
                CallStatus::Waiting => {}
                CallStatus::Assigned => {
                    released_driver = call.assigned_driver_id.take();
                }
                _ => return Err(DispatchError::Conflict),
            }
            call.status = CallStatus::Cancelled;
            call.touch();
            call.assert_invariants();
            Ok(())
        })?;

        info!(call = %call.id, "call cancelled");
        if let Some(driver_id) = released_driver {
            let token = self
                .store
                .drivers
                .get(driver_id.as_str())
                .and_then(|d| d.push_token);
            send_best_effort(
                self.notifier.as_ref(),
                NotificationEvent::CallCancelled {
                    call_id: call.id.clone(),
                },
                token.as_deref(),
            )
            .await;
        }
        Ok(())
    }

    /// Live list of WAITING calls for an office, the dispatcher console's
    /// recovery read after a conflict.
    pub fn waiting_calls(&self, office_id: &OfficeId) -> Vec<Call> {
        let mut calls = self
            .store
            .calls
            .filter(|c| c.status == CallStatus::Waiting && &c.office_id == office_id);
        calls.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        calls
    }

    /// Open shared calls for an office.
    pub fn open_shared_calls(&self, office_id: &OfficeId) -> Vec<SharedCall> {
        let mut shared = self
            .store
            .shared_calls
            .filter(|s| s.status == SharedCallStatus::Open && &s.office_id == office_id);
        shared.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        shared
    }
}
