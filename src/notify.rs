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

//! Notification dispatcher boundary.
//!
//! Push transport is an external collaborator. This crate only fires events
//! at it: sends are best-effort, failures are logged locally and never
//! retried here.

use crate::base::{CallId, DriverId};
use async_trait::async_trait;
use crossbeam::queue::SegQueue;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "event")]
pub enum NotificationEvent {
    CallAssigned { call_id: CallId, driver_id: DriverId },
    CallCancelled { call_id: CallId },
}

/// Delivery boundary for assignment/status events.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Fire-and-forget send. Implementations report transport failures via
    /// the error, which callers log and drop.
    async fn send(&self, event: NotificationEvent, recipient_token: &str) -> Result<(), String>;
}

/// Sends a notification without letting a transport failure affect the
/// caller's outcome.
pub(crate) async fn send_best_effort(
    notifier: &dyn Notifier,
    event: NotificationEvent,
    recipient_token: Option<&str>,
) {
    let Some(token) = recipient_token else {
        info!(?event, "no push token registered, notification skipped");
        return;
    };
    if let Err(reason) = notifier.send(event.clone(), token).await {
        warn!(?event, %reason, "notification send failed, dropped");
    }
}

/// Default notifier: logs every send and records it in an order-preserving
/// outbox. The outbox is what tests assert against.
#[derive(Debug, Default)]
pub struct LogNotifier {
    outbox: SegQueue<(NotificationEvent, String)>,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drains the outbox in send order.
    pub fn drain(&self) -> Vec<(NotificationEvent, String)> {
        let mut sent = Vec::new();
        while let Some(entry) = self.outbox.pop() {
            sent.push(entry);
        }
        sent
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, event: NotificationEvent, recipient_token: &str) -> Result<(), String> {
        info!(?event, token = recipient_token, "notification sent");
        self.outbox.push((event, recipient_token.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_notifier_preserves_send_order() {
        let notifier = LogNotifier::new();
        for i in 0..3 {
            let event = NotificationEvent::CallAssigned {
                call_id: CallId(format!("c{i}")),
                driver_id: DriverId::from("d1"),
            };
            notifier.send(event, "token-1").await.unwrap();
        }

        let sent = notifier.drain();
        assert_eq!(sent.len(), 3);
        let ids: Vec<_> = sent
            .iter()
            .map(|(event, _)| match event {
                NotificationEvent::CallAssigned { call_id, .. } => call_id.as_str().to_string(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(ids, vec!["c0", "c1", "c2"]);
    }

    #[tokio::test]
    async fn missing_token_is_not_an_error() {
        let notifier = LogNotifier::new();
        send_best_effort(
            &notifier,
            NotificationEvent::CallCancelled {
                call_id: CallId::from("c1"),
            },
            None,
        )
        .await;
        assert!(notifier.drain().is_empty());
    }
}
