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

//! # Dispatch Ledger
//!
//! Coordination core for a designated-driver dispatch service: the lifecycle
//! of a call from creation through assignment, trip execution, financial
//! settlement, and daily close-out, shared by a dispatcher console, many
//! driver sessions, and backend triggers.
//!
//! ## Core Components
//!
//! - [`DispatchStore`]: the shared document store every actor mutates
//! - [`Dispatcher`]: race-safe assignment and shared-call claiming
//! - [`TripLifecycle`]: the guarded status transitions of a call
//! - [`SettlementLedger`]: append-only financial records with atomic correction
//! - [`CreditLedger`]: accounts receivable for deferred payments
//! - [`DailyCloseout`]: idempotent daily archival
//! - [`SettlementTrigger`]: backend actor deriving settlements from completed calls
//!
//! ## Example
//!
//! ```
//! use std::sync::Arc;
//! use dispatch_ledger_rs::{
//!     Call, CallId, Dispatcher, DispatchStore, DriverId, DriverStatus, LogNotifier,
//!     OfficeId, RegionId, SessionCtx,
//! };
//!
//! let rt = tokio::runtime::Runtime::new().unwrap();
//! rt.block_on(async {
//!     let store = DispatchStore::new();
//!     let dispatcher = Dispatcher::new(store.clone(), Arc::new(LogNotifier::new()));
//!
//!     let driver = DriverStatus::new(
//!         DriverId::from("d1"),
//!         RegionId::from("r1"),
//!         OfficeId::from("o1"),
//!     );
//!     store.drivers.put("d1", driver);
//!
//!     let call = Call::new(
//!         CallId::from("c1"),
//!         RegionId::from("r1"),
//!         OfficeId::from("o1"),
//!         "Kim",
//!         "010-1234-5678",
//!         "Gangnam Station",
//!         "Mapo",
//!     );
//!     dispatcher.open_call(call).await.unwrap();
//!
//!     let session = SessionCtx::new(
//!         DriverId::from("d1"),
//!         RegionId::from("r1"),
//!         OfficeId::from("o1"),
//!     );
//!     let assigned = dispatcher.assign(&CallId::from("c1"), &session).await.unwrap();
//!     assert_eq!(assigned.assigned_driver_id, Some(DriverId::from("d1")));
//! });
//! ```
//!
//! ## Concurrency
//!
//! There is no central lock manager. Independent actors race against the
//! same documents; every cross-field invariant is enforced by the store's
//! per-document conditional transactions and its exclusive batch gate, and
//! every caller must treat its own reads as possibly stale.

pub mod base;
pub mod call;
pub mod credit;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod finalize;
pub mod notify;
pub mod retry;
pub mod settlement;
pub mod store;
pub mod trigger;
pub mod trip;

pub use base::{
    CallId, CustomerKey, DriverId, OfficeId, RegionId, SessionCtx, SettlementId, SharedCallId,
};
pub use call::{Call, CallStatus, PaymentMethod, SharedCall, SharedCallStatus};
pub use credit::{CreditAccount, CreditLedger, derive_customer_key};
pub use dispatch::Dispatcher;
pub use driver::{DriverState, DriverStatus};
pub use error::DispatchError;
pub use finalize::{DailyCloseout, DailySession, FinalizeOutcome};
pub use notify::{LogNotifier, NotificationEvent, Notifier};
pub use retry::{RetryOutcome, poll_until};
pub use settlement::{Settlement, SettlementLedger, SettlementStatus, work_date};
pub use store::{Change, Collection, DispatchStore, Subscription};
pub use trigger::SettlementTrigger;
pub use trip::{SettleOutcome, TripLifecycle};
