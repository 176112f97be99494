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

//! Bounded retry with fixed backoff.
//!
//! Used for the one place the system tolerates cross-document lag: waiting
//! for the backend trigger to attach a settlement id to a completed call.
//! The budget is fixed and exhaustion is an explicit outcome, never a hidden
//! loop or a fatal error.

use std::future::Future;
use std::time::Duration;

/// Result of a bounded poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryOutcome<T> {
    /// The condition held within the budget.
    Done(T),
    /// Every attempt came back empty; the caller proceeds without the value.
    GaveUp { attempts: u32 },
}

impl<T> RetryOutcome<T> {
    pub fn done(self) -> Option<T> {
        match self {
            Self::Done(value) => Some(value),
            Self::GaveUp { .. } => None,
        }
    }
}

/// Polls `probe` up to `attempts` times, sleeping `backoff` between attempts,
/// until it yields `Some`.
///
/// The first attempt runs immediately; the backoff only separates attempts.
pub async fn poll_until<T, F, Fut>(attempts: u32, backoff: Duration, mut probe: F) -> RetryOutcome<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    for attempt in 0..attempts {
        if let Some(value) = probe().await {
            return RetryOutcome::Done(value);
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(backoff).await;
        }
    }
    RetryOutcome::GaveUp { attempts }
}
