//! Application assembly: wire the offline core together and spawn the
//! background worker.
//!
//! Everything is injected at construction — stores, network backend,
//! connectivity flag — so no component reaches for ambient state.

use color_eyre::Result;
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::cache::{CacheManager, SqliteCacheStore};
use crate::config::Config;
use crate::control::{control_channel, ControlHandle};
use crate::data::{DataUrls, Datasets};
use crate::fetch::{HttpNetwork, Network, OnlineFlag};
use crate::router::{ClassifyRules, Interceptor};
use crate::store::SqliteQueueStore;
use crate::sync::{SyncEngine, SyncEvent};
use crate::worker::Worker;

/// A running agent: the detached background worker plus the foreground
/// handles. The worker stops when the last control handle is dropped.
pub struct App {
  pub handle: ControlHandle,
  pub interceptor: Arc<Interceptor>,
  pub datasets: Datasets,
  engine: SyncEngine,
}

impl App {
  pub fn new(config: &Config) -> Result<Self> {
    let net: Arc<dyn Network> = Arc::new(HttpNetwork::new()?);
    let online = OnlineFlag::new(true);

    let queue = Arc::new(SqliteQueueStore::open(&config.queue_db_path()?)?);
    let cache = Arc::new(SqliteCacheStore::open(&config.cache_db_path()?)?);

    let manager = CacheManager::new(
      cache,
      Arc::clone(&net),
      online.clone(),
      config.caches.static_name.clone(),
      config.caches.data_name.clone(),
    );
    let engine = SyncEngine::new(queue.clone(), Arc::clone(&net));
    let rules = ClassifyRules::new(&config.endpoint, config.data_file_names());
    let interceptor = Arc::new(Interceptor::new(
      rules,
      manager.clone(),
      engine.clone(),
      Arc::clone(&net),
    ));
    let datasets = Datasets::new(Arc::clone(&interceptor), DataUrls::from_config(config)?);

    let (handle, rx) = control_channel();
    let worker = Worker::new(config, rx, queue, manager, engine.clone(), net, online);
    tokio::spawn(worker.run());

    Ok(Self {
      handle,
      interceptor,
      datasets,
      engine,
    })
  }

  /// Subscribe to delivery notifications from the sync engine.
  pub fn subscribe_sync_events(&self) -> broadcast::Receiver<SyncEvent> {
    self.engine.subscribe()
  }
}
