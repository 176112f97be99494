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

//! Backend trigger: settlement creation off the call change stream.
//!
//! The trigger is its own actor. It folds over the call collection's
//! change subscription and, when a call reaches COMPLETED, derives the
//! settlement and attaches its id back onto the call. Duplicate delivery
//! is harmless: settlement creation is idempotent per call.
//!
//! A lagged listener recovers by restarting the subscription and re-reading
//! current state (a full sweep for completed calls missing their
//! settlement), never by replaying mutations.

use crate::call::{Call, CallStatus};
use crate::settlement::SettlementLedger;
use crate::store::DispatchStore;
use chrono::Local;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Give up after this many consecutive subscription failures; a healthy
/// channel never fails twice in a row after a restart.
const MAX_CONSECUTIVE_FAILURES: u32 = 3;

pub struct SettlementTrigger {
    store: Arc<DispatchStore>,
    settlements: Arc<SettlementLedger>,
}

impl SettlementTrigger {
    pub fn new(store: Arc<DispatchStore>, settlements: Arc<SettlementLedger>) -> Self {
        Self { store, settlements }
    }

    /// Trigger entry point, one invocation per observed call write.
    ///
    /// Creates the settlement when the call has just reached COMPLETED.
    /// Errors are logged and swallowed: a trigger failure must never take
    /// the listener down, and the recovery sweep will retry the call.
    pub fn on_call_written(&self, before: Option<&Call>, after: &Call) {
        let was_completed = before.is_some_and(|c| c.status == CallStatus::Completed);
        if after.status != CallStatus::Completed || was_completed {
            return;
        }
        match self
            .settlements
            .create_from_completed_call(after, Local::now().naive_local())
        {
            Ok(settlement) => {
                debug!(call = %after.id, settlement = %settlement.id, "trigger created settlement")
            }
            Err(error) => warn!(call = %after.id, %error, "trigger failed to create settlement"),
        }
    }

    /// Sweeps current state for completed calls that never got their
    /// settlement, the recovery read after listener lag.
    pub fn recover(&self) {
        let orphaned = self
            .store
            .calls
            .filter(|c| c.status == CallStatus::Completed && c.settlement_id.is_none());
        for call in orphaned {
            self.on_call_written(None, &call);
        }
    }

    /// Runs the trigger as a background actor until the store goes away.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut sub = self.store.calls.subscribe();
            let mut consecutive_failures = 0u32;
            loop {
                match sub.next().await {
                    Ok(change) => {
                        consecutive_failures = 0;
                        if let Some(after) = &change.after {
                            self.on_call_written(change.before.as_ref(), after);
                        }
                    }
                    Err(error) => {
                        consecutive_failures += 1;
                        if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                            warn!(%error, "settlement trigger giving up");
                            return;
                        }
                        warn!(%error, "settlement trigger lagged, restarting subscription");
                        sub.restart();
                        self.recover();
                    }
                }
            }
        })
    }
}
