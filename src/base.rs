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

//! Core identifier types and the per-session context.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

macro_rules! string_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            /// Generates a fresh random identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }
    };
}

string_id! {
    /// Unique identifier for a dispatch call.
    CallId
}

string_id! {
    /// Unique identifier for a shared (broadcast) call.
    SharedCallId
}

string_id! {
    /// Unique identifier for a driver.
    DriverId
}

string_id! {
    /// Unique identifier for a settlement record.
    SettlementId
}

string_id! {
    /// Region a call or driver belongs to.
    RegionId
}

string_id! {
    /// Office within a region.
    OfficeId
}

string_id! {
    /// Key into the credit ledger, derived from customer name or phone.
    CustomerKey
}

/// Session-scoped context identifying the acting driver and their office.
///
/// Every coordinator operation takes one of these explicitly instead of
/// reading ambient per-process state, so two sessions in one process cannot
/// observe each other's driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCtx {
    pub driver_id: DriverId,
    pub region_id: RegionId,
    pub office_id: OfficeId,
}

impl SessionCtx {
    pub fn new(driver_id: DriverId, region_id: RegionId, office_id: OfficeId) -> Self {
        Self {
            driver_id,
            region_id,
            office_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        let a = CallId::generate();
        let b = CallId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn ids_serialize_transparently() {
        let id = DriverId::from("driver-7");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"driver-7\"");
    }

    #[test]
    fn display_matches_inner() {
        let id = OfficeId::from("office-1");
        assert_eq!(id.to_string(), "office-1");
        assert_eq!(id.as_str(), "office-1");
    }
}
