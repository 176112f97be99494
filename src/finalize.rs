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

//! Daily finalization: the office's close-out.
//!
//! One invocation flips every open settlement to finalized in a single
//! all-or-nothing batch and appends one [`DailySession`] record. Settlements
//! are archived, never deleted. Re-invoking on a closed day finds zero open
//! settlements and appends a zero-total session, so finalization is
//! idempotent with respect to double counting, and an idle day (zero-total
//! session present) is distinguishable from an unclosed one (no session).

use crate::base::{OfficeId, RegionId};
use crate::error::DispatchError;
use crate::settlement::{SettlementStatus, work_date};
use crate::store::DispatchStore;
use chrono::{DateTime, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// One close-out record. Append-only: every finalize invocation writes a
/// fresh row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailySession {
    pub id: String,
    pub region_id: RegionId,
    pub office_id: OfficeId,
    /// Business day being closed, `YYYY-MM-DD`.
    pub date: String,
    pub end_at: DateTime<Utc>,
    pub total_trips: u32,
    pub total_fare: Decimal,
}

/// What a finalize invocation archived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizeOutcome {
    pub total_trips: u32,
    pub total_fare: Decimal,
    pub session_id: String,
}

pub struct DailyCloseout {
    store: Arc<DispatchStore>,
}

impl DailyCloseout {
    pub fn new(store: Arc<DispatchStore>) -> Self {
        Self { store }
    }

    /// Closes out the office: flips every open settlement to finalized and
    /// appends the day's session record.
    ///
    /// `at_local` determines the business day via the 6am boundary rule.
    /// This is the body of the authenticated finalize-day callable; the
    /// caller surfaces `total_trips` from the outcome.
    pub async fn finalize(
        &self,
        region_id: &RegionId,
        office_id: &OfficeId,
        at_local: NaiveDateTime,
    ) -> Result<FinalizeOutcome, DispatchError> {
        let outcome = self.store.exclusive(|| {
            let open = self.store.settlements.filter_ungated(|s| {
                !s.is_finalized && &s.region_id == region_id && &s.office_id == office_id
            });

            // Corrected rows are archived with the batch but excluded from
            // the tallies; their replacement row carries the money.
            let mut total_trips = 0u32;
            let mut total_fare = Decimal::ZERO;
            for settlement in &open {
                if settlement.settlement_status != SettlementStatus::Corrected {
                    total_trips += 1;
                    total_fare += settlement.fare;
                }
            }

            for settlement in &open {
                self.store
                    .settlements
                    .update_if_ungated(settlement.id.as_str(), |s| {
                        s.is_finalized = true;
                        Ok(())
                    })?;
            }

            let session = DailySession {
                id: Uuid::new_v4().to_string(),
                region_id: region_id.clone(),
                office_id: office_id.clone(),
                date: work_date(at_local).to_string(),
                end_at: Utc::now(),
                total_trips,
                total_fare,
            };
            let session_id = session.id.clone();
            self.store.sessions.insert_new_ungated(&session_id, session)?;

            Ok::<_, DispatchError>(FinalizeOutcome {
                total_trips,
                total_fare,
                session_id,
            })
        })?;

        info!(
            office = %office_id,
            trips = outcome.total_trips,
            fare = %outcome.total_fare,
            "day finalized"
        );
        Ok(outcome)
    }

    /// Close-out history for an office, newest first.
    pub fn sessions(&self, region_id: &RegionId, office_id: &OfficeId) -> Vec<DailySession> {
        let mut sessions = self
            .store
            .sessions
            .filter(|s| &s.region_id == region_id && &s.office_id == office_id);
        sessions.sort_by(|a, b| b.end_at.cmp(&a.end_at));
        sessions
    }
}
