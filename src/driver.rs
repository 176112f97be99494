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

//! Per-driver availability state, kept in lockstep with the driver's call.
//!
//! Invariant: a driver is `OnTrip` iff they currently own exactly one call
//! in ACCEPTED or IN_PROGRESS. The trip state machine is the only writer
//! that moves a driver in or out of `Preparing`/`OnTrip`.

use crate::base::{DriverId, OfficeId, RegionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverState {
    Offline,
    Waiting,
    Preparing,
    OnTrip,
}

impl DriverState {
    /// A driver occupied by a trip cannot take another assignment.
    pub fn is_occupied(self) -> bool {
        matches!(self, Self::Preparing | Self::OnTrip)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverStatus {
    pub driver_id: DriverId,
    pub region_id: RegionId,
    pub office_id: OfficeId,
    pub state: DriverState,
    /// Device token for the notification dispatcher; absent for devices
    /// that never registered for push.
    pub push_token: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl DriverStatus {
    /// New drivers come online waiting for work.
    pub fn new(driver_id: DriverId, region_id: RegionId, office_id: OfficeId) -> Self {
        Self {
            driver_id,
            region_id,
            office_id,
            state: DriverState::Waiting,
            push_token: None,
            updated_at: Utc::now(),
        }
    }

    pub fn with_push_token(mut self, token: impl Into<String>) -> Self {
        self.push_token = Some(token.into());
        self
    }
}
