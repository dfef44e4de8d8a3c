//! Cache manager: manifest warming and the two serving policies.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::fetch::{Network, OnlineFlag, Request, Response};

use super::storage::CacheStore;

/// Orchestrates the static-asset and bulk-data caches.
///
/// Bulk-data files are served cache-first with an opportunistic background
/// refresh while online (stale-while-revalidate). Static assets are served
/// cache-first with network fallback. Neither policy ever surfaces a raw
/// network error to the caller.
pub struct CacheManager {
  store: Arc<dyn CacheStore>,
  net: Arc<dyn Network>,
  online: OnlineFlag,
  static_cache: String,
  data_cache: String,
}

impl CacheManager {
  pub fn new(
    store: Arc<dyn CacheStore>,
    net: Arc<dyn Network>,
    online: OnlineFlag,
    static_cache: impl Into<String>,
    data_cache: impl Into<String>,
  ) -> Self {
    Self {
      store,
      net,
      online,
      static_cache: static_cache.into(),
      data_cache: data_cache.into(),
    }
  }

  /// Warm both caches from their manifests. The two warms run in parallel
  /// and fail independently; each manifest is atomic on its own.
  pub async fn warm_all(
    &self,
    static_urls: &[String],
    data_urls: &[String],
  ) -> (Result<()>, Result<()>) {
    let (static_result, data_result) = futures::future::join(
      self.warm_into(&self.static_cache, static_urls),
      self.warm_into(&self.data_cache, data_urls),
    )
    .await;

    match &static_result {
      Ok(()) => info!(count = static_urls.len(), "Static asset cache warmed"),
      Err(e) => warn!("Static asset warm failed: {}", e),
    }
    match &data_result {
      Ok(()) => info!(count = data_urls.len(), "Data file cache warmed"),
      Err(e) => warn!("Data file warm failed: {}", e),
    }

    (static_result, data_result)
  }

  /// Fetch every manifest entry, then store the batch only if all fetches
  /// succeeded. A single failed asset fails the whole manifest and leaves
  /// the cache untouched.
  async fn warm_into(&self, cache_name: &str, urls: &[String]) -> Result<()> {
    let fetches = urls.iter().map(|url| self.net.fetch(Request::get(url)));
    let responses = futures::future::try_join_all(fetches).await?;

    for (url, response) in urls.iter().zip(&responses) {
      if !response.is_success() {
        return Err(eyre!(
          "Warm fetch for {} returned status {}",
          url,
          response.status
        ));
      }
    }

    for (url, response) in urls.iter().zip(responses) {
      self.store.store(cache_name, url, &response)?;
    }

    Ok(())
  }

  /// Serve a bulk-data file: cache-first, background refresh on hit while
  /// online, typed empty fallback when neither cache nor network can help.
  pub async fn serve_data_file(&self, request: &Request) -> Response {
    match self.store.lookup(&self.data_cache, &request.url) {
      Ok(Some(cached)) => {
        debug!(url = %request.url, stored_at = %cached.stored_at, "Serving data file from cache");
        if self.online.is_online() {
          self.spawn_refresh(request.clone());
        }
        return cached.into_response();
      }
      Ok(None) => {}
      Err(e) => warn!(url = %request.url, "Data cache lookup failed: {}", e),
    }

    match self.net.fetch(request.clone()).await {
      Ok(response) if response.is_success() => {
        if let Err(e) = self.store.store(&self.data_cache, &request.url, &response) {
          warn!(url = %request.url, "Failed to cache data file: {}", e);
        }
        response
      }
      Ok(response) => {
        warn!(url = %request.url, status = response.status, "Data file fetch failed");
        Self::data_fallback(request)
      }
      Err(e) => {
        warn!(url = %request.url, "Data file fetch failed: {}", e);
        Self::data_fallback(request)
      }
    }
  }

  /// JSON-shaped resources degrade to an empty list, everything else to 503.
  fn data_fallback(request: &Request) -> Response {
    if request.path().ends_with(".json") {
      Response::empty_json_list()
    } else {
      Response::unavailable("File not available offline")
    }
  }

  fn spawn_refresh(&self, request: Request) {
    let manager = self.clone();
    tokio::spawn(async move {
      manager.refresh_data_file(request).await;
    });
  }

  /// Non-blocking refresh behind a cache hit: overwrite the entry on
  /// success, log and move on otherwise.
  async fn refresh_data_file(&self, request: Request) {
    match self.net.fetch(request.clone()).await {
      Ok(response) if response.is_success() => {
        match self.store.store(&self.data_cache, &request.url, &response) {
          Ok(()) => debug!(url = %request.url, "Refreshed data file cache in background"),
          Err(e) => warn!(url = %request.url, "Background cache update failed: {}", e),
        }
      }
      Ok(response) => {
        debug!(url = %request.url, status = response.status, "Background refresh skipped")
      }
      Err(e) => debug!(url = %request.url, "Background refresh failed: {}", e),
    }
  }

  /// Serve a static asset: cache-first with network fallback; successful
  /// network responses populate the cache.
  pub async fn serve_static_asset(&self, request: &Request) -> Response {
    match self.store.lookup(&self.static_cache, &request.url) {
      Ok(Some(cached)) => return cached.into_response(),
      Ok(None) => {}
      Err(e) => warn!(url = %request.url, "Static cache lookup failed: {}", e),
    }

    match self.net.fetch(request.clone()).await {
      Ok(response) if response.is_success() => {
        if let Err(e) = self
          .store
          .store(&self.static_cache, &request.url, &response)
        {
          warn!(url = %request.url, "Failed to cache static asset: {}", e);
        }
        response
      }
      Ok(response) => response,
      Err(e) => {
        warn!(url = %request.url, "Static asset fetch failed: {}", e);
        Response::unavailable("Content not available offline")
      }
    }
  }

  /// Delete every cache whose name is not one of the current generation
  /// names. Runs once at activation. Returns the deleted names.
  pub fn purge_stale(&self) -> Result<Vec<String>> {
    let current = [self.static_cache.as_str(), self.data_cache.as_str()];
    let mut deleted = Vec::new();

    for name in self.store.cache_names()? {
      if !current.contains(&name.as_str()) {
        info!(cache = %name, "Deleting old cache");
        self.store.delete_cache(&name)?;
        deleted.push(name);
      }
    }

    Ok(deleted)
  }

  /// Delete every named cache, current generation included. The submission
  /// queue is not touched.
  pub fn clear_all(&self) -> Result<()> {
    for name in self.store.cache_names()? {
      self.store.delete_cache(&name)?;
    }
    info!("All caches cleared");
    Ok(())
  }
}

impl Clone for CacheManager {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      net: Arc::clone(&self.net),
      online: self.online.clone(),
      static_cache: self.static_cache.clone(),
      data_cache: self.data_cache.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteCacheStore;
  use crate::fetch::testing::StubNetwork;
  use std::time::Duration;

  const STATIC_CACHE: &str = "carnet-static-v1";
  const DATA_CACHE: &str = "carnet-data-v1";

  struct Harness {
    manager: CacheManager,
    store: Arc<SqliteCacheStore>,
    net: Arc<StubNetwork>,
    online: OnlineFlag,
  }

  fn harness() -> Harness {
    let store = Arc::new(SqliteCacheStore::open_in_memory().unwrap());
    let net = Arc::new(StubNetwork::new());
    let online = OnlineFlag::new(true);
    let manager = CacheManager::new(
      store.clone(),
      net.clone(),
      online.clone(),
      STATIC_CACHE,
      DATA_CACHE,
    );
    Harness {
      manager,
      store,
      net,
      online,
    }
  }

  #[tokio::test]
  async fn warm_is_atomic_per_manifest_and_independent_across() {
    let h = harness();

    let static_urls = vec![
      "https://app.example.com/index.html".to_string(),
      "https://app.example.com/missing.js".to_string(),
    ];
    let data_urls = vec!["https://app.example.com/gare.json".to_string()];

    h.net
      .respond_body("https://app.example.com/index.html", 200, "<html>");
    h.net.fail("https://app.example.com/missing.js");
    h.net
      .respond_body("https://app.example.com/gare.json", 200, "[]");

    let (static_result, data_result) = h.manager.warm_all(&static_urls, &data_urls).await;

    assert!(static_result.is_err());
    assert!(data_result.is_ok());

    // The failed manifest stored nothing, not even the asset that succeeded.
    assert!(h
      .store
      .lookup(STATIC_CACHE, "https://app.example.com/index.html")
      .unwrap()
      .is_none());
    assert!(h
      .store
      .lookup(DATA_CACHE, "https://app.example.com/gare.json")
      .unwrap()
      .is_some());
  }

  #[tokio::test]
  async fn data_file_miss_with_network_down_yields_empty_list() {
    let h = harness();
    let request = Request::get("https://app.example.com/streets.json");
    h.net.fail(&request.url);

    let response = h.manager.serve_data_file(&request).await;

    assert_eq!(response.status, 200);
    let value: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(value, serde_json::json!([]));
  }

  #[tokio::test]
  async fn data_file_miss_non_json_yields_unavailable() {
    let h = harness();
    let request = Request::get("https://app.example.com/plan.png");
    h.net.fail(&request.url);

    let response = h.manager.serve_data_file(&request).await;
    assert_eq!(response.status, 503);
  }

  #[tokio::test]
  async fn data_file_hit_refreshes_in_background_while_online() {
    let h = harness();
    let url = "https://app.example.com/gare.json";

    h.store
      .store(
        DATA_CACHE,
        url,
        &Response {
          status: 200,
          headers: Default::default(),
          body: b"[\"old\"]".to_vec(),
        },
      )
      .unwrap();
    h.net.respond_body(url, 200, "[\"new\"]");

    let response = h.manager.serve_data_file(&Request::get(url)).await;
    assert_eq!(response.body, b"[\"old\"]");

    // Let the spawned refresh settle, then the entry must be overwritten.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let hit = h.store.lookup(DATA_CACHE, url).unwrap().unwrap();
    assert_eq!(hit.body, b"[\"new\"]");
  }

  #[tokio::test]
  async fn data_file_hit_skips_refresh_while_offline() {
    let h = harness();
    let url = "https://app.example.com/gare.json";

    h.store
      .store(
        DATA_CACHE,
        url,
        &Response {
          status: 200,
          headers: Default::default(),
          body: b"[]".to_vec(),
        },
      )
      .unwrap();
    h.online.set_online(false);

    let response = h.manager.serve_data_file(&Request::get(url)).await;
    assert_eq!(response.status, 200);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(h.net.seen_count(url), 0);
  }

  #[tokio::test]
  async fn static_asset_network_success_populates_cache() {
    let h = harness();
    let url = "https://app.example.com/index.html";
    h.net.respond_body(url, 200, "<html>");

    let response = h.manager.serve_static_asset(&Request::get(url)).await;
    assert_eq!(response.status, 200);
    assert!(h.store.lookup(STATIC_CACHE, url).unwrap().is_some());

    // Second request is a cache hit; no extra network traffic.
    h.manager.serve_static_asset(&Request::get(url)).await;
    assert_eq!(h.net.seen_count(url), 1);
  }

  #[tokio::test]
  async fn static_asset_total_failure_yields_unavailable() {
    let h = harness();
    let url = "https://app.example.com/vite.svg";
    h.net.fail(url);

    let response = h.manager.serve_static_asset(&Request::get(url)).await;
    assert_eq!(response.status, 503);
  }

  #[tokio::test]
  async fn purge_deletes_exactly_the_stale_generations() {
    let store = Arc::new(SqliteCacheStore::open_in_memory().unwrap());
    let net = Arc::new(StubNetwork::new());
    let manager = CacheManager::new(
      store.clone(),
      net,
      OnlineFlag::new(true),
      "carnet-static-v2",
      "carnet-data-v2",
    );

    let body = Response {
      status: 200,
      headers: Default::default(),
      body: b"x".to_vec(),
    };
    store.store("carnet-static-v1", "u", &body).unwrap();
    store.store("carnet-data-v1", "u", &body).unwrap();
    store.store("carnet-static-v2", "u", &body).unwrap();

    let mut deleted = manager.purge_stale().unwrap();
    deleted.sort();
    assert_eq!(deleted, vec!["carnet-data-v1", "carnet-static-v1"]);
    assert_eq!(store.cache_names().unwrap(), vec!["carnet-static-v2"]);
  }

  #[tokio::test]
  async fn clear_all_empties_every_cache() {
    let h = harness();
    let body = Response {
      status: 200,
      headers: Default::default(),
      body: b"x".to_vec(),
    };
    h.store.store(STATIC_CACHE, "a", &body).unwrap();
    h.store.store(DATA_CACHE, "b", &body).unwrap();

    h.manager.clear_all().unwrap();
    assert!(h.store.cache_names().unwrap().is_empty());
  }
}
