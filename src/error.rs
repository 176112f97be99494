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

//! Error types for dispatch coordination.

use thiserror::Error;

/// Dispatch coordination errors.
///
/// `Conflict` and `AlreadyClaimed` are expected outcomes of optimistic
/// guards, not faults: the caller recovers by re-reading live state, never
/// by blindly retrying the same mutation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Optimistic guard failed: the document changed under the caller
    #[error("precondition failed, document changed concurrently")]
    Conflict,

    /// Another driver claimed the shared call first
    #[error("shared call already claimed")]
    AlreadyClaimed,

    /// Referenced document vanished mid-flow
    #[error("document not found")]
    NotFound,

    /// Malformed amount or missing required field
    #[error("validation failed: {0}")]
    Validation(String),

    /// Listener or channel failure, recovered by re-subscribing
    #[error("transient infrastructure failure: {0}")]
    TransientInfra(String),

    /// The settlement id never materialized within the poll window
    #[error("settlement id not attached within retry budget")]
    ReconciliationTimeout,
}

#[cfg(test)]
mod tests {
    use super::DispatchError;

    #[test]
    fn error_display_messages() {
        assert_eq!(
            DispatchError::Conflict.to_string(),
            "precondition failed, document changed concurrently"
        );
        assert_eq!(
            DispatchError::AlreadyClaimed.to_string(),
            "shared call already claimed"
        );
        assert_eq!(DispatchError::NotFound.to_string(), "document not found");
        assert_eq!(
            DispatchError::Validation("fare must be positive".into()).to_string(),
            "validation failed: fare must be positive"
        );
        assert_eq!(
            DispatchError::TransientInfra("listener lagged".into()).to_string(),
            "transient infrastructure failure: listener lagged"
        );
        assert_eq!(
            DispatchError::ReconciliationTimeout.to_string(),
            "settlement id not attached within retry budget"
        );
    }

    #[test]
    fn errors_are_cloneable() {
        let error = DispatchError::Conflict;
        let cloned = error.clone();
        assert_eq!(error, cloned);
    }
}
