//! Submission capture and queue drain.
//!
//! Capture runs when a remote-write network attempt fails: the snapshotted
//! request becomes a durable record. Drain replays every queued record
//! against the network, one at a time, deleting each only after the
//! endpoint confirms delivery. Failures are isolated per record; a broken
//! submission never blocks the rest of the queue.

use color_eyre::Result;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::fetch::{Network, Request};
use crate::store::{QueueStore, QueuedSubmission};

/// Broadcast to every connected session when a queued submission lands.
/// Wire shape: `{"type":"survey-synced","data":{"id":"…"}}`.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum SyncEvent {
  SurveySynced { id: String },
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
  /// Ids confirmed delivered and removed from the queue.
  pub delivered: Vec<String>,
  /// Records that stayed queued after a failed attempt.
  pub failed: usize,
  /// Malformed records skipped (and kept) this pass.
  pub skipped: usize,
}

pub struct SyncEngine {
  store: Arc<dyn QueueStore>,
  net: Arc<dyn Network>,
  events: broadcast::Sender<SyncEvent>,
}

impl SyncEngine {
  pub fn new(store: Arc<dyn QueueStore>, net: Arc<dyn Network>) -> Self {
    let (events, _) = broadcast::channel(64);
    Self { store, net, events }
  }

  /// Subscribe to delivery notifications.
  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.events.subscribe()
  }

  /// Durably queue a failed submission.
  ///
  /// The request passed here is the interception-time snapshot; its body was
  /// captured before any network attempt could consume it. A store failure
  /// propagates so the caller can return an explicit error to the
  /// foreground instead of a false "queued" acknowledgement.
  pub fn capture(&self, request: &Request) -> Result<QueuedSubmission> {
    let submission = QueuedSubmission::new(
      request.url.clone(),
      request.method.clone(),
      request.headers.clone(),
      request.body.clone().unwrap_or_default(),
    );

    self.store.upsert(&submission)?;
    info!(id = %submission.id, "Survey queued for background sync");

    Ok(submission)
  }

  /// Replay every queued submission. Valid records are attempted in capture
  /// order; each is deleted only on confirmed HTTP success, via a fresh
  /// store call after the network await. Malformed records are skipped and
  /// preserved.
  pub async fn drain(&self) -> DrainReport {
    let mut report = DrainReport::default();

    let submissions = match self.store.list_all() {
      Ok(list) => list,
      Err(e) => {
        warn!("Drain skipped, queue store unavailable: {}", e);
        return report;
      }
    };

    info!(count = submissions.len(), "Draining submission queue");

    for submission in submissions {
      if submission.is_malformed() {
        warn!(id = %submission.id, "Skipping malformed queued record");
        report.skipped += 1;
        continue;
      }

      let request = Request {
        url: submission.url.clone(),
        method: submission.method.clone(),
        headers: submission.headers.clone(),
        body: Some(submission.body.clone()),
      };

      match self.net.fetch(request).await {
        Ok(response) if response.is_success() => match self.store.delete(&submission.id) {
          Ok(()) => {
            info!(id = %submission.id, "Survey synced successfully");
            let _ = self.events.send(SyncEvent::SurveySynced {
              id: submission.id.clone(),
            });
            report.delivered.push(submission.id);
          }
          Err(e) => {
            // Delivered but still queued; the next drain will retry and the
            // endpoint sees a duplicate. Accepted at-least-once trade-off.
            error!(id = %submission.id, "Delivered submission could not be deleted: {}", e);
            report.failed += 1;
          }
        },
        Ok(response) => {
          warn!(id = %submission.id, status = response.status, "Survey sync failed");
          report.failed += 1;
        }
        Err(e) => {
          warn!(id = %submission.id, "Error syncing survey: {}", e);
          report.failed += 1;
        }
      }
    }

    report
  }
}

impl Clone for SyncEngine {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      net: Arc::clone(&self.net),
      events: self.events.clone(),
    }
  }
}
