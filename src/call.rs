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

//! Call documents.
//!
//! A [`Call`] is the single source of truth for one trip. Its status moves
//! monotonically forward through [`CallStatus`]; corrections never rewind a
//! call, they append a new settlement instead.
//!
//! Status machine:
//!
//! ```text
//!  Waiting ──assign/claim──► Assigned ──accept──► Accepted ──start──► InProgress
//!      │                                                                  │
//!      └──cancel──► Cancelled              AwaitingSettlement ◄──complete──┘
//!                                                  │
//!                              Completed ◄──confirm settlement
//! ```

use crate::base::{CallId, DriverId, OfficeId, RegionId, SettlementId, SharedCallId};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallStatus {
    Waiting,
    Assigned,
    Accepted,
    InProgress,
    AwaitingSettlement,
    Completed,
    Cancelled,
}

impl CallStatus {
    /// True for the statuses in which exactly one driver owns the call.
    pub fn holds_driver(self) -> bool {
        matches!(
            self,
            Self::Assigned
                | Self::Accepted
                | Self::InProgress
                | Self::AwaitingSettlement
                | Self::Completed
        )
    }

    /// Terminal statuses accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled)
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Waiting => "WAITING",
            Self::Assigned => "ASSIGNED",
            Self::Accepted => "ACCEPTED",
            Self::InProgress => "IN_PROGRESS",
            Self::AwaitingSettlement => "AWAITING_SETTLEMENT",
            Self::Completed => "COMPLETED",
            Self::Cancelled => "CANCELLED",
        };
        write!(f, "{s}")
    }
}

/// How the customer paid for a completed trip. `Credit` and `CashAndCredit`
/// carry a deferred portion that lands on the customer's credit account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Cash,
    Card,
    Credit,
    #[serde(rename = "cash+credit")]
    CashAndCredit,
}

impl PaymentMethod {
    pub fn has_deferred_portion(self) -> bool {
        matches!(self, Self::Credit | Self::CashAndCredit)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "cash" => Some(Self::Cash),
            "card" => Some(Self::Card),
            "credit" => Some(Self::Credit),
            "cash+credit" | "cash_and_credit" => Some(Self::CashAndCredit),
            _ => None,
        }
    }
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Cash => "cash",
            Self::Card => "card",
            Self::Credit => "credit",
            Self::CashAndCredit => "cash+credit",
        };
        write!(f, "{s}")
    }
}

/// A dispatch call document.
///
/// Customer-entered trip fields (`departure`, `destination`, `waypoints`,
/// `fare`) are kept distinct from the `*_set` fields the driver writes at
/// trip start; only the `*_set` values feed the settlement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub id: CallId,
    pub region_id: RegionId,
    pub office_id: OfficeId,
    pub status: CallStatus,
    pub assigned_driver_id: Option<DriverId>,

    pub customer_name: String,
    pub customer_phone: String,
    pub customer_address: String,

    pub departure: String,
    pub destination: String,
    pub waypoints: Vec<String>,
    pub fare: Option<Decimal>,

    pub departure_set: Option<String>,
    pub destination_set: Option<String>,
    pub waypoints_set: Vec<String>,
    pub fare_set: Option<Decimal>,

    pub payment_method: Option<PaymentMethod>,
    pub fare_final: Option<Decimal>,
    pub trip_summary_final: Option<String>,
    pub cash_received: Option<Decimal>,
    pub credit_amount: Option<Decimal>,

    pub settlement_id: Option<SettlementId>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Call {
    pub fn new(
        id: CallId,
        region_id: RegionId,
        office_id: OfficeId,
        customer_name: impl Into<String>,
        customer_phone: impl Into<String>,
        departure: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            region_id,
            office_id,
            status: CallStatus::Waiting,
            assigned_driver_id: None,
            customer_name: customer_name.into(),
            customer_phone: customer_phone.into(),
            customer_address: String::new(),
            departure: departure.into(),
            destination: destination.into(),
            waypoints: Vec::new(),
            fare: None,
            departure_set: None,
            destination_set: None,
            waypoints_set: Vec::new(),
            fare_set: None,
            payment_method: None,
            fare_final: None,
            trip_summary_final: None,
            cash_received: None,
            credit_amount: None,
            settlement_id: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub(crate) fn assert_invariants(&self) {
        debug_assert_eq!(
            self.assigned_driver_id.is_some(),
            self.status.holds_driver(),
            "Invariant violated: assigned_driver_id must be set iff status holds a driver \
             (status={}, call={})",
            self.status,
            self.id,
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SharedCallStatus {
    Open,
    Claimed,
    Cancelled,
}

/// A call broadcast to every waiting driver in the office. The first driver
/// to claim it wins; on claim it materializes into a regular [`Call`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedCall {
    pub id: SharedCallId,
    pub region_id: RegionId,
    pub office_id: OfficeId,
    pub status: SharedCallStatus,
    pub claimed_by: Option<DriverId>,

    pub customer_name: String,
    pub customer_phone: String,
    pub departure: String,
    pub destination: String,
    pub fare: Option<Decimal>,

    pub created_at: DateTime<Utc>,
}

impl SharedCall {
    pub fn new(
        id: SharedCallId,
        region_id: RegionId,
        office_id: OfficeId,
        customer_name: impl Into<String>,
        customer_phone: impl Into<String>,
        departure: impl Into<String>,
        destination: impl Into<String>,
    ) -> Self {
        Self {
            id,
            region_id,
            office_id,
            status: SharedCallStatus::Open,
            claimed_by: None,
            customer_name: customer_name.into(),
            customer_phone: customer_phone.into(),
            departure: departure.into(),
            destination: destination.into(),
            fare: None,
            created_at: Utc::now(),
        }
    }

    /// Builds the call a successful claim materializes, already assigned to
    /// the claiming driver.
    pub(crate) fn materialize(&self, call_id: CallId, driver_id: DriverId) -> Call {
        let mut call = Call::new(
            call_id,
            self.region_id.clone(),
            self.office_id.clone(),
            self.customer_name.clone(),
            self.customer_phone.clone(),
            self.departure.clone(),
            self.destination.clone(),
        );
        call.fare = self.fare;
        call.status = CallStatus::Assigned;
        call.assigned_driver_id = Some(driver_id);
        call.assert_invariants();
        call
    }
}
