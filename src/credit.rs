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

//! Credit ledger: accounts receivable for deferred and partial payments.
//!
//! A credit account is the one genuinely hot shared document in the system
//! (one regular customer, many simultaneous settlements), so increments go
//! through the store's atomic upsert-merge and decrements through a single
//! entry-locked read-then-write. There is no application-level locking.
//!
//! Accounts close themselves: a decrement that brings the balance to zero
//! (or below) deletes the document.

use crate::base::CustomerKey;
use crate::error::DispatchError;
use crate::store::DispatchStore;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditAccount {
    pub key: CustomerKey,
    pub name: String,
    pub phone: String,
    pub memo: String,
    pub total_owed: Decimal,
    pub last_updated: DateTime<Utc>,
}

impl CreditAccount {
    fn assert_invariants(&self) {
        debug_assert!(
            self.total_owed >= Decimal::ZERO,
            "Invariant violated: credit balance went negative: {} ({})",
            self.total_owed,
            self.key,
        );
    }
}

/// Derives the ledger key for a customer: a sanitized slug of the name,
/// falling back to the phone digits, falling back to a synthetic key.
///
/// Distinct names that sanitize to the same slug share one account; that
/// aggregation is deliberate. Customers with neither name nor phone get a
/// synthetic key so unrelated anonymous tabs never merge.
pub fn derive_customer_key(name: &str, phone: &str) -> CustomerKey {
    let slug = sanitize_slug(name);
    if !slug.is_empty() {
        return CustomerKey(slug);
    }
    let digits: String = phone.chars().filter(|c| c.is_ascii_digit()).collect();
    if !digits.is_empty() {
        return CustomerKey(format!("tel-{digits}"));
    }
    CustomerKey(format!("anon-{}", Uuid::new_v4().simple()))
}

fn sanitize_slug(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_was_dash = true; // suppress a leading dash
    for c in name.trim().to_lowercase().chars() {
        if c.is_alphanumeric() {
            slug.push(c);
            last_was_dash = false;
        } else if !last_was_dash {
            slug.push('-');
            last_was_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

/// Credit ledger operations.
pub struct CreditLedger {
    store: Arc<DispatchStore>,
}

impl CreditLedger {
    pub fn new(store: Arc<DispatchStore>) -> Self {
        Self { store }
    }

    /// Adds `amount` to the customer's tab, creating the account if needed.
    ///
    /// Uses the store's atomic insert-or-merge: two settlements crediting
    /// the same customer at the same time both land, never a lost update.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Validation`] for a non-positive amount.
    pub fn increment(
        &self,
        key: &CustomerKey,
        amount: Decimal,
        name: &str,
        phone: &str,
        memo: &str,
    ) -> Result<CreditAccount, DispatchError> {
        if amount <= Decimal::ZERO {
            return Err(DispatchError::Validation(
                "credit amount must be positive".into(),
            ));
        }

        let account = self.store.credits.upsert_merge(
            key.as_str(),
            || CreditAccount {
                key: key.clone(),
                name: name.to_string(),
                phone: phone.to_string(),
                memo: String::new(),
                total_owed: Decimal::ZERO,
                last_updated: Utc::now(),
            },
            |account| {
                account.total_owed += amount;
                if !memo.is_empty() {
                    account.memo = memo.to_string();
                }
                account.last_updated = Utc::now();
                account.assert_invariants();
            },
        );
        info!(customer = %key, %amount, balance = %account.total_owed, "credit incremented");
        Ok(account)
    }

    /// Pays `amount` off the customer's tab. A payment covering the whole
    /// balance deletes the account.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::Validation`] for a non-positive amount.
    /// - [`DispatchError::NotFound`] if no account exists for the key.
    pub fn decrement(&self, key: &CustomerKey, amount: Decimal) -> Result<Decimal, DispatchError> {
        if amount <= Decimal::ZERO {
            return Err(DispatchError::Validation(
                "payment amount must be positive".into(),
            ));
        }

        let account = self.store.credits.update_or_remove(key.as_str(), |account| {
            account.total_owed -= amount;
            account.last_updated = Utc::now();
            Ok(account.total_owed <= Decimal::ZERO)
        })?;

        let remaining = account.total_owed.max(Decimal::ZERO);
        info!(customer = %key, %amount, %remaining, "credit decremented");
        Ok(remaining)
    }

    /// Reads one account.
    pub fn get(&self, key: &CustomerKey) -> Option<CreditAccount> {
        self.store.credits.get(key.as_str())
    }

    /// All open accounts, largest balance first.
    pub fn accounts(&self) -> Vec<CreditAccount> {
        let mut accounts = self.store.credits.filter(|_| true);
        accounts.sort_by(|a, b| b.total_owed.cmp(&a.total_owed));
        accounts
    }
}
