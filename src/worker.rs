//! Background worker: the single task that owns the offline core.
//!
//! The worker services control messages, ticks the drain timer, and probes
//! connectivity, all in one `select!` loop — so its own drain triggers
//! (force-sync, timer, reconnect) are naturally serialized. Startup mirrors
//! an install/activate cycle: warm both manifests, then purge cache
//! generations that no longer match the configured names.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::CacheManager;
use crate::config::Config;
use crate::control::{ControlAck, ControlRequest, QueueSnapshot};
use crate::fetch::{Network, OnlineFlag, Request};
use crate::store::QueueStore;
use crate::sync::SyncEngine;

pub struct Worker {
  rx: mpsc::Receiver<ControlRequest>,
  store: Arc<dyn QueueStore>,
  manager: CacheManager,
  engine: SyncEngine,
  net: Arc<dyn Network>,
  online: OnlineFlag,
  probe_url: String,
  drain_interval: Duration,
  probe_interval: Duration,
  static_urls: Vec<String>,
  data_urls: Vec<String>,
}

impl Worker {
  pub fn new(
    config: &Config,
    rx: mpsc::Receiver<ControlRequest>,
    store: Arc<dyn QueueStore>,
    manager: CacheManager,
    engine: SyncEngine,
    net: Arc<dyn Network>,
    online: OnlineFlag,
  ) -> Self {
    Self {
      rx,
      store,
      manager,
      engine,
      net,
      online,
      probe_url: config.probe_url(),
      drain_interval: Duration::from_secs(config.sync.drain_interval_secs),
      probe_interval: Duration::from_secs(config.sync.probe_interval_secs),
      static_urls: config.static_asset_urls(),
      data_urls: config.data_file_urls(),
    }
  }

  /// Run until the control channel closes.
  pub async fn run(mut self) {
    // Install-and-activate runs off the main loop: a slow warm must not
    // delay control replies past their caller-side timeouts.
    let manager = self.manager.clone();
    let static_urls = self.static_urls.clone();
    let data_urls = self.data_urls.clone();
    tokio::spawn(async move {
      manager.warm_all(&static_urls, &data_urls).await;
      if let Err(e) = manager.purge_stale() {
        warn!("Cache purge failed: {}", e);
      }
    });

    let mut drain_tick = tokio::time::interval(self.drain_interval);
    drain_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut probe_tick = tokio::time::interval(self.probe_interval);
    probe_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
      tokio::select! {
        message = self.rx.recv() => match message {
          Some(request) => self.handle(request).await,
          None => {
            info!("Control channel closed, worker stopping");
            break;
          }
        },
        _ = drain_tick.tick() => {
          // An empty queue skips the pass entirely, so the periodic tick
          // stays silent between submissions.
          if self.online.is_online() && self.store.count().map(|n| n > 0).unwrap_or(false) {
            let report = self.engine.drain().await;
            debug!(delivered = report.delivered.len(), failed = report.failed, "Periodic drain");
          }
        }
        _ = probe_tick.tick() => self.probe().await,
      }
    }
  }

  async fn handle(&self, request: ControlRequest) {
    match request {
      ControlRequest::GetSyncStatus { reply } => {
        let _ = reply.send(self.snapshot());
      }
      ControlRequest::ForceSync { reply } => {
        // Per-record failures stay in the report; the reply only says the
        // drain ran to completion.
        let report = self.engine.drain().await;
        info!(
          delivered = report.delivered.len(),
          failed = report.failed,
          skipped = report.skipped,
          "Forced sync finished"
        );
        let _ = reply.send(ControlAck::ok());
      }
      ControlRequest::ClearCache { reply } => {
        let ack = match self.manager.clear_all() {
          Ok(()) => ControlAck::ok(),
          Err(e) => ControlAck::failed(e.to_string()),
        };
        let _ = reply.send(ack);
      }
    }
  }

  fn snapshot(&self) -> QueueSnapshot {
    match self.store.summaries() {
      Ok(surveys) => QueueSnapshot {
        pending_count: surveys.len(),
        surveys,
        error: None,
      },
      Err(e) => {
        warn!("Queue store unreachable for status: {}", e);
        QueueSnapshot::degraded(e.to_string())
      }
    }
  }

  /// One connectivity probe; an offline→online transition drains the queue.
  async fn probe(&self) {
    let online = self
      .net
      .fetch(Request::head(self.probe_url.as_str()))
      .await
      .is_ok();
    let was_online = self.online.set_online(online);

    if online && !was_online {
      info!("Connectivity restored, draining queue");
      self.engine.drain().await;
    } else if !online && was_online {
      info!("Connectivity lost, submissions will be queued");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheStore, SqliteCacheStore};
  use crate::control::control_channel;
  use crate::fetch::testing::StubNetwork;
  use crate::fetch::Response;
  use crate::store::{QueuedSubmission, SqliteQueueStore};
  use std::collections::HashMap;

  const ENDPOINT: &str = "https://firestore.example.com/v1/documents/surveys";
  const PROBE: &str = "https://survey.example.com/";

  fn config() -> Config {
    serde_yaml::from_str(
      r#"
app_origin: https://survey.example.com
endpoint:
  host: firestore.example.com
  submit_url: https://firestore.example.com/v1/documents/surveys
manifests:
  static_assets: []
  data_files: []
sync:
  drain_interval_secs: 3600
  probe_interval_secs: 1
"#,
    )
    .unwrap()
  }

  struct Rig {
    handle: crate::control::ControlHandle,
    queue: Arc<SqliteQueueStore>,
    cache: Arc<SqliteCacheStore>,
    net: Arc<StubNetwork>,
    online: OnlineFlag,
  }

  fn rig(online_at_start: bool) -> Rig {
    let queue = Arc::new(SqliteQueueStore::open_in_memory().unwrap());
    let cache = Arc::new(SqliteCacheStore::open_in_memory().unwrap());
    let net = Arc::new(StubNetwork::new());
    let online = OnlineFlag::new(online_at_start);

    let manager = CacheManager::new(
      cache.clone(),
      net.clone(),
      online.clone(),
      "carnet-static-v1",
      "carnet-data-v1",
    );
    let engine = SyncEngine::new(queue.clone(), net.clone());
    let (handle, rx) = control_channel();

    let worker = Worker::new(
      &config(),
      rx,
      queue.clone(),
      manager,
      engine,
      net.clone(),
      online.clone(),
    );
    tokio::spawn(worker.run());

    Rig {
      handle,
      queue,
      cache,
      net,
      online,
    }
  }

  fn queue_submission(queue: &SqliteQueueStore, id: &str) {
    let mut s = QueuedSubmission::new(ENDPOINT, "POST", HashMap::new(), r#"{"q":1}"#);
    s.id = id.to_string();
    queue.upsert(&s).unwrap();
  }

  #[tokio::test]
  async fn force_sync_drains_and_acknowledges() {
    let r = rig(true);
    r.net.fail(PROBE);
    queue_submission(&r.queue, "s1");
    r.net.respond_status(ENDPOINT, 200);

    let ack = r.handle.force_sync().await;
    assert!(ack.success);
    assert_eq!(r.queue.count().unwrap(), 0);
  }

  #[tokio::test]
  async fn force_sync_succeeds_even_when_records_fail() {
    let r = rig(true);
    r.net.fail(PROBE);
    queue_submission(&r.queue, "s1");
    r.net.respond_status(ENDPOINT, 500);

    let ack = r.handle.force_sync().await;
    assert!(ack.success);
    assert_eq!(r.queue.count().unwrap(), 1);
  }

  #[tokio::test]
  async fn status_reports_pending_summaries() {
    let r = rig(true);
    r.net.fail(PROBE);
    queue_submission(&r.queue, "s1");
    queue_submission(&r.queue, "s2");

    let snapshot = r.handle.sync_status().await;
    assert_eq!(snapshot.pending_count, 2);
    let ids: Vec<&str> = snapshot.surveys.iter().map(|s| s.id.as_str()).collect();
    assert!(ids.contains(&"s1") && ids.contains(&"s2"));
  }

  #[tokio::test]
  async fn clear_cache_leaves_the_queue_alone() {
    let r = rig(true);
    r.net.fail(PROBE);
    queue_submission(&r.queue, "s1");
    r.cache
      .store(
        "carnet-static-v1",
        "https://survey.example.com/index.html",
        &Response {
          status: 200,
          headers: Default::default(),
          body: b"x".to_vec(),
        },
      )
      .unwrap();

    let ack = r.handle.clear_cache().await;
    assert!(ack.success);
    assert!(r.cache.cache_names().unwrap().is_empty());
    assert_eq!(r.queue.count().unwrap(), 1);
  }

  #[tokio::test]
  async fn status_degrades_when_store_is_unreachable() {
    let cache = Arc::new(SqliteCacheStore::open_in_memory().unwrap());
    let net = Arc::new(StubNetwork::new());
    let online = OnlineFlag::new(true);
    let store: Arc<dyn QueueStore> = Arc::new(crate::store::testing::FailingStore);

    let manager = CacheManager::new(
      cache,
      net.clone(),
      online.clone(),
      "carnet-static-v1",
      "carnet-data-v1",
    );
    let engine = SyncEngine::new(store.clone(), net.clone());
    let (handle, rx) = control_channel();
    tokio::spawn(Worker::new(&config(), rx, store, manager, engine, net, online).run());

    let snapshot = handle.sync_status().await;
    assert_eq!(snapshot.pending_count, 0);
    assert!(snapshot.surveys.is_empty());
    assert!(snapshot.error.is_some());
  }

  #[tokio::test(start_paused = true)]
  async fn reconnect_triggers_a_drain() {
    let r = rig(false);
    queue_submission(&r.queue, "s1");
    r.net.respond_status(ENDPOINT, 200);

    // The agent starts offline; the first successful probe is the
    // offline-to-online transition.
    r.net.respond_status(PROBE, 200);

    for _ in 0..50 {
      tokio::time::sleep(Duration::from_secs(1)).await;
      if r.queue.count().unwrap() == 0 {
        break;
      }
    }

    assert!(r.online.is_online());
    assert_eq!(r.queue.count().unwrap(), 0);
  }
}
