//! Control channel between foreground sessions and the background worker.
//!
//! A typed request/reply protocol: each request carries its own oneshot
//! reply channel, and the caller races every reply against a fixed timeout.
//! A handler that cannot determine queue state still answers — the
//! foreground is never left waiting indefinitely.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::store::PendingSurvey;
use crate::sync::SyncEvent;

pub const STATUS_TIMEOUT: Duration = Duration::from_secs(2);
pub const FORCE_SYNC_TIMEOUT: Duration = Duration::from_secs(10);
pub const CLEAR_CACHE_TIMEOUT: Duration = Duration::from_secs(5);

/// Queue state summary handed to the foreground: identities and ages only,
/// never bodies or headers.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
  pub pending_count: usize,
  pub surveys: Vec<PendingSurvey>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl QueueSnapshot {
  /// Safe zero-state when the queue store cannot be read.
  pub fn degraded(error: impl Into<String>) -> Self {
    Self {
      pending_count: 0,
      surveys: Vec::new(),
      error: Some(error.into()),
    }
  }
}

/// Reply for force-sync and clear-cache requests.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ControlAck {
  pub success: bool,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl ControlAck {
  pub fn ok() -> Self {
    Self {
      success: true,
      error: None,
    }
  }

  pub fn failed(error: impl Into<String>) -> Self {
    Self {
      success: false,
      error: Some(error.into()),
    }
  }
}

/// Requests understood by the background worker. Wire kinds:
/// GET_SYNC_STATUS, FORCE_SYNC, CLEAR_CACHE.
#[derive(Debug)]
pub enum ControlRequest {
  GetSyncStatus { reply: oneshot::Sender<QueueSnapshot> },
  ForceSync { reply: oneshot::Sender<ControlAck> },
  ClearCache { reply: oneshot::Sender<ControlAck> },
}

/// Create the control channel; the receiver goes to the worker.
pub fn control_channel() -> (ControlHandle, mpsc::Receiver<ControlRequest>) {
  let (tx, rx) = mpsc::channel(16);
  (ControlHandle { tx }, rx)
}

/// Foreground handle to the worker. Every call resolves: a missing worker,
/// a dropped reply, or a timeout all fall back to a conservative default
/// rather than hanging.
#[derive(Clone)]
pub struct ControlHandle {
  tx: mpsc::Sender<ControlRequest>,
}

impl ControlHandle {
  /// Query queue state. Falls back to a degraded zero-state after 2s.
  pub async fn sync_status(&self) -> QueueSnapshot {
    let (reply, rx) = oneshot::channel();
    if self
      .tx
      .send(ControlRequest::GetSyncStatus { reply })
      .await
      .is_err()
    {
      return QueueSnapshot::degraded("sync worker is not running");
    }

    match tokio::time::timeout(STATUS_TIMEOUT, rx).await {
      Ok(Ok(snapshot)) => snapshot,
      Ok(Err(_)) => QueueSnapshot::degraded("sync worker dropped the request"),
      Err(_) => QueueSnapshot::degraded("timed out waiting for sync status"),
    }
  }

  /// Trigger a drain and wait for it to complete. Individual record
  /// failures do not fail this call; only a missing or stuck worker does.
  pub async fn force_sync(&self) -> ControlAck {
    let (reply, rx) = oneshot::channel();
    if self
      .tx
      .send(ControlRequest::ForceSync { reply })
      .await
      .is_err()
    {
      return ControlAck::failed("sync worker is not running");
    }

    match tokio::time::timeout(FORCE_SYNC_TIMEOUT, rx).await {
      Ok(Ok(ack)) => ack,
      Ok(Err(_)) => ControlAck::failed("sync worker dropped the request"),
      Err(_) => ControlAck::failed("timed out waiting for sync"),
    }
  }

  /// Delete every named cache. The submission queue is left alone.
  pub async fn clear_cache(&self) -> ControlAck {
    let (reply, rx) = oneshot::channel();
    if self
      .tx
      .send(ControlRequest::ClearCache { reply })
      .await
      .is_err()
    {
      return ControlAck::failed("sync worker is not running");
    }

    match tokio::time::timeout(CLEAR_CACHE_TIMEOUT, rx).await {
      Ok(Ok(ack)) => ack,
      Ok(Err(_)) => ControlAck::failed("sync worker dropped the request"),
      Err(_) => ControlAck::failed("timed out waiting for cache clear"),
    }
  }
}

/// Foreground-side view of sync state, rebuilt from snapshots and delivery
/// events. Never persisted.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
  pub pending_count: usize,
  pub is_syncing: bool,
  pub last_sync: Option<DateTime<Utc>>,
  pub sync_error: Option<String>,
}

impl SyncStatus {
  pub fn apply_snapshot(&mut self, snapshot: &QueueSnapshot) {
    self.pending_count = snapshot.pending_count;
    self.sync_error = snapshot.error.clone();
  }

  pub fn apply_event(&mut self, event: &SyncEvent) {
    match event {
      SyncEvent::SurveySynced { .. } => {
        self.pending_count = self.pending_count.saturating_sub(1);
        self.last_sync = Some(Utc::now());
      }
    }
  }
}
