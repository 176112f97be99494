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

//! Shared document store.
//!
//! Every actor in the system (dispatcher console, driver sessions, backend
//! triggers) mutates the same [`DispatchStore`]. There is no client-side
//! locking anywhere above this module: cross-field invariants are enforced
//! here, through per-document guarded mutations and store-wide exclusive
//! batches.
//!
//! # Consistency model
//!
//! - A guarded mutation ([`Collection::update_if`]) runs its closure under
//!   the document's entry lock. The guard re-validates the precondition
//!   against the live document; on failure the document is left untouched
//!   and the typed error is returned. Mutations of one document are totally
//!   ordered against each other.
//! - [`Collection::upsert_merge`] is an atomic insert-or-merge for counters
//!   that must never be read-modify-written outside a lock.
//! - Multi-document operations go through the store-wide writer gate:
//!   single-document reads and writes hold it shared, a batch holds it
//!   exclusively and validates every precondition before its first write.
//!   Partial application of a batch is therefore never observable.
//! - Every successful write broadcasts a [`Change`] snapshot. Listener lag
//!   surfaces as [`DispatchError::TransientInfra`]; the consumer recovers by
//!   restarting the subscription and re-reading current state.

use crate::call::{Call, SharedCall};
use crate::credit::CreditAccount;
use crate::driver::DriverStatus;
use crate::error::DispatchError;
use crate::finalize::DailySession;
use crate::settlement::Settlement;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Capacity of each collection's change channel. A receiver that falls more
/// than this far behind is lagged and must restart.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// One observed write: the document before and after. `before == None` is a
/// creation, `after == None` a deletion.
#[derive(Debug, Clone)]
pub struct Change<T> {
    pub id: String,
    pub before: Option<T>,
    pub after: Option<T>,
}

/// A live query over one collection: a lazy, unbounded, restartable sequence
/// of change snapshots. Consumers fold over it instead of polling.
pub struct Subscription<T> {
    rx: broadcast::Receiver<Change<T>>,
    tx: broadcast::Sender<Change<T>>,
}

impl<T: Clone + Send + 'static> Subscription<T> {
    /// Waits for the next change.
    ///
    /// # Errors
    ///
    /// [`DispatchError::TransientInfra`] if the receiver lagged or the
    /// channel closed. Recover with [`Subscription::restart`] and a fresh
    /// read of current state; never replay mutations.
    pub async fn next(&mut self) -> Result<Change<T>, DispatchError> {
        match self.rx.recv().await {
            Ok(change) => Ok(change),
            Err(broadcast::error::RecvError::Lagged(missed)) => Err(DispatchError::TransientInfra(
                format!("listener lagged, {missed} changes dropped"),
            )),
            Err(broadcast::error::RecvError::Closed) => {
                Err(DispatchError::TransientInfra("change channel closed".into()))
            }
        }
    }

    /// Drops the lagged receiver and rejoins the live stream. Changes
    /// between the lag and the restart are lost; the caller re-reads
    /// current state to compensate.
    pub fn restart(&mut self) {
        self.rx = self.tx.subscribe();
    }
}

/// A collection of documents keyed by id.
#[derive(Debug)]
pub struct Collection<T> {
    docs: DashMap<String, T>,
    gate: Arc<RwLock<()>>,
    events: broadcast::Sender<Change<T>>,
}

impl<T: Clone + Send + 'static> Collection<T> {
    fn new(gate: Arc<RwLock<()>>) -> Self {
        let (events, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            docs: DashMap::new(),
            gate,
            events,
        }
    }

    /// Reads one document.
    pub fn get(&self, id: &str) -> Option<T> {
        let _shared = self.gate.read();
        self.docs.get(id).map(|doc| doc.clone())
    }

    /// Returns all documents matching the predicate.
    pub fn filter(&self, pred: impl Fn(&T) -> bool) -> Vec<T> {
        let _shared = self.gate.read();
        self.filter_ungated(pred)
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Creates a document, failing if the id is already taken.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Conflict`] if a document with this id exists.
    pub fn insert_new(&self, id: &str, doc: T) -> Result<(), DispatchError> {
        let _shared = self.gate.read();
        self.insert_new_ungated(id, doc)
    }

    /// Unconditionally writes a document (seed/replace).
    pub fn put(&self, id: &str, doc: T) {
        let _shared = self.gate.read();
        let before = self.docs.insert(id.to_string(), doc.clone());
        self.emit(id, before, Some(doc));
    }

    /// Guarded conditional mutation of one document.
    ///
    /// The closure re-validates its precondition against the live document
    /// and mutates it in place. It runs under the document's entry lock, so
    /// a concurrent mutation of the same document either happens entirely
    /// before or entirely after this one. On guard failure the document is
    /// untouched.
    ///
    /// # Errors
    ///
    /// [`DispatchError::NotFound`] if the document does not exist, otherwise
    /// whatever the guard returns.
    pub fn update_if<F>(&self, id: &str, f: F) -> Result<T, DispatchError>
    where
        F: FnOnce(&mut T) -> Result<(), DispatchError>,
    {
        let _shared = self.gate.read();
        self.update_if_ungated(id, f)
    }

    /// Atomic insert-or-merge under the entry lock.
    ///
    /// Concurrent merges on the same id serialize; none is lost. This is the
    /// only safe way to maintain a shared counter in the store.
    pub fn upsert_merge<I, M>(&self, id: &str, init: I, merge: M) -> T
    where
        I: FnOnce() -> T,
        M: FnOnce(&mut T),
    {
        let _shared = self.gate.read();
        match self.docs.entry(id.to_string()) {
            Entry::Occupied(mut entry) => {
                let before = entry.get().clone();
                merge(entry.get_mut());
                let after = entry.get().clone();
                drop(entry);
                self.emit(id, Some(before), Some(after.clone()));
                after
            }
            Entry::Vacant(entry) => {
                let mut doc = init();
                merge(&mut doc);
                entry.insert(doc.clone());
                self.emit(id, None, Some(doc.clone()));
                doc
            }
        }
    }

    /// Guarded mutation that may end in deletion.
    ///
    /// The closure mutates the document and returns `true` to delete it
    /// afterwards, all under the entry lock. Returns the final document
    /// state (the deleted state when removed).
    pub fn update_or_remove<F>(&self, id: &str, f: F) -> Result<T, DispatchError>
    where
        F: FnOnce(&mut T) -> Result<bool, DispatchError>,
    {
        let _shared = self.gate.read();
        match self.docs.entry(id.to_string()) {
            Entry::Occupied(mut entry) => {
                let before = entry.get().clone();
                let mut candidate = before.clone();
                let remove = f(&mut candidate)?;
                if remove {
                    entry.remove();
                    self.emit(id, Some(before), None);
                } else {
                    *entry.get_mut() = candidate.clone();
                    self.emit(id, Some(before), Some(candidate.clone()));
                }
                Ok(candidate)
            }
            Entry::Vacant(_) => Err(DispatchError::NotFound),
        }
    }

    /// Deletes a document if present.
    pub fn remove(&self, id: &str) -> Option<T> {
        let _shared = self.gate.read();
        let removed = self.docs.remove(id).map(|(_, doc)| doc);
        if let Some(doc) = &removed {
            self.emit(id, Some(doc.clone()), None);
        }
        removed
    }

    /// Subscribes to this collection's change stream.
    pub fn subscribe(&self) -> Subscription<T> {
        Subscription {
            rx: self.events.subscribe(),
            tx: self.events.clone(),
        }
    }

    // --- gate-free variants, for use inside an exclusive batch only ---

    pub(crate) fn get_ungated(&self, id: &str) -> Option<T> {
        self.docs.get(id).map(|doc| doc.clone())
    }

    pub(crate) fn filter_ungated(&self, pred: impl Fn(&T) -> bool) -> Vec<T> {
        self.docs
            .iter()
            .filter(|entry| pred(entry.value()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub(crate) fn insert_new_ungated(&self, id: &str, doc: T) -> Result<(), DispatchError> {
        match self.docs.entry(id.to_string()) {
            Entry::Occupied(_) => Err(DispatchError::Conflict),
            Entry::Vacant(entry) => {
                entry.insert(doc.clone());
                self.emit(id, None, Some(doc));
                Ok(())
            }
        }
    }

    pub(crate) fn update_if_ungated<F>(&self, id: &str, f: F) -> Result<T, DispatchError>
    where
        F: FnOnce(&mut T) -> Result<(), DispatchError>,
    {
        let mut entry = self.docs.get_mut(id).ok_or(DispatchError::NotFound)?;
        let before = entry.clone();
        let mut candidate = before.clone();
        f(&mut candidate)?;
        *entry = candidate.clone();
        drop(entry);
        self.emit(id, Some(before), Some(candidate.clone()));
        Ok(candidate)
    }

    fn emit(&self, id: &str, before: Option<T>, after: Option<T>) {
        // A send error only means no subscriber is listening.
        let _ = self.events.send(Change {
            id: id.to_string(),
            before,
            after,
        });
    }
}

/// The shared store all actors operate against: one collection per document
/// kind, plus the writer gate that makes cross-document batches atomic.
#[derive(Debug)]
pub struct DispatchStore {
    gate: Arc<RwLock<()>>,
    pub calls: Collection<Call>,
    pub shared_calls: Collection<SharedCall>,
    pub drivers: Collection<DriverStatus>,
    pub settlements: Collection<Settlement>,
    pub credits: Collection<CreditAccount>,
    pub sessions: Collection<DailySession>,
}

impl DispatchStore {
    pub fn new() -> Arc<Self> {
        let gate = Arc::new(RwLock::new(()));
        Arc::new(Self {
            calls: Collection::new(gate.clone()),
            shared_calls: Collection::new(gate.clone()),
            drivers: Collection::new(gate.clone()),
            settlements: Collection::new(gate.clone()),
            credits: Collection::new(gate.clone()),
            sessions: Collection::new(gate.clone()),
            gate,
        })
    }

    /// Runs `f` while holding the writer gate exclusively.
    ///
    /// Inside, only the `*_ungated` collection methods may be used; the gated
    /// ones would deadlock. Callers must perform every validating read before
    /// the first write so a guard failure leaves nothing applied.
    pub(crate) fn exclusive<R>(&self, f: impl FnOnce() -> R) -> R {
        let _exclusive = self.gate.write();
        f()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::base::{DriverId, OfficeId, RegionId};
    use crate::driver::{DriverState, DriverStatus};

    fn waiting_driver(id: &str) -> DriverStatus {
        DriverStatus::new(
            DriverId::from(id),
            RegionId::from("r1"),
            OfficeId::from("o1"),
        )
    }

    #[test]
    fn insert_new_rejects_duplicate_id() {
        let store = DispatchStore::new();
        store.drivers.insert_new("d1", waiting_driver("d1")).unwrap();
        let result = store.drivers.insert_new("d1", waiting_driver("d1"));
        assert_eq!(result, Err(DispatchError::Conflict));
    }

    #[test]
    fn failed_guard_leaves_document_untouched() {
        let store = DispatchStore::new();
        store.drivers.insert_new("d1", waiting_driver("d1")).unwrap();

        let result = store.drivers.update_if("d1", |driver| {
            driver.state = DriverState::OnTrip;
            Err(DispatchError::Conflict)
        });

        assert_eq!(result, Err(DispatchError::Conflict));
        let driver = store.drivers.get("d1").unwrap();
        assert_eq!(driver.state, DriverState::Waiting);
    }

    #[test]
    fn update_if_missing_document_is_not_found() {
        let store = DispatchStore::new();
        let result = store.drivers.update_if("ghost", |_| Ok(()));
        assert_eq!(result, Err(DispatchError::NotFound));
    }

    #[test]
    fn update_or_remove_deletes_when_asked() {
        let store = DispatchStore::new();
        store.drivers.insert_new("d1", waiting_driver("d1")).unwrap();
        store.drivers.update_or_remove("d1", |_| Ok(true)).unwrap();
        assert!(store.drivers.get("d1").is_none());
    }

    #[tokio::test]
    async fn subscription_sees_creation_and_update() {
        let store = DispatchStore::new();
        let mut sub = store.drivers.subscribe();

        store.drivers.insert_new("d1", waiting_driver("d1")).unwrap();
        store
            .drivers
            .update_if("d1", |driver| {
                driver.state = DriverState::Preparing;
                Ok(())
            })
            .unwrap();

        let created = sub.next().await.unwrap();
        assert!(created.before.is_none());
        assert_eq!(created.after.unwrap().state, DriverState::Waiting);

        let updated = sub.next().await.unwrap();
        assert_eq!(updated.before.unwrap().state, DriverState::Waiting);
        assert_eq!(updated.after.unwrap().state, DriverState::Preparing);
    }

    #[tokio::test]
    async fn lagged_subscription_restarts() {
        let store = DispatchStore::new();
        let mut sub = store.drivers.subscribe();

        // Overflow the channel so the receiver lags.
        for i in 0..(CHANGE_CHANNEL_CAPACITY + 10) {
            let id = format!("d{i}");
            store.drivers.put(&id, waiting_driver(&id));
        }

        let result = sub.next().await;
        assert!(matches!(result, Err(DispatchError::TransientInfra(_))));

        sub.restart();
        store.drivers.put("fresh", waiting_driver("fresh"));
        let change = sub.next().await.unwrap();
        assert_eq!(change.id, "fresh");
    }

    #[test]
    fn concurrent_upsert_merge_loses_nothing() {
        use std::thread;

        let store = DispatchStore::new();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    store.drivers.upsert_merge(
                        "d1",
                        || waiting_driver("d1"),
                        |_| {},
                    );
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.drivers.len(), 1);
    }
}
