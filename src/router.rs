//! Request interception: classification and dispatch.
//!
//! Every outgoing request is classified into one of four handling
//! strategies. Rule order matters: a bulk-data file must never fall through
//! to the generic static-asset policy (different cache, different fallback
//! shape), and a realtime listener connection to the write endpoint must
//! never end up in the submission queue.

use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::CacheManager;
use crate::config::EndpointConfig;
use crate::fetch::{Network, Request, Response};
use crate::sync::SyncEngine;

/// Handling strategy for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// A document mutation bound for the remote write endpoint; queued on
  /// network failure.
  RemoteWrite,
  /// One of the known bulk-data files.
  DataFile,
  /// Any other safe read.
  StaticAsset,
  /// Forwarded unmodified.
  Passthrough,
}

/// Classification rule set. Everything here comes from configuration; the
/// mutation-vs-listener distinction in particular is a heuristic, not a
/// constant.
#[derive(Debug, Clone)]
pub struct ClassifyRules {
  /// Substring matched against the request host.
  write_host: String,
  /// Verbs that count as writes.
  write_methods: Vec<String>,
  /// Path substrings that mark a document mutation.
  mutation_markers: Vec<String>,
  /// Path substrings that mark a realtime listener channel.
  listener_markers: Vec<String>,
  /// Known bulk-data file names, matched as URL suffixes.
  data_files: Vec<String>,
}

impl ClassifyRules {
  pub fn new(endpoint: &EndpointConfig, data_files: Vec<String>) -> Self {
    Self {
      write_host: endpoint.host.clone(),
      write_methods: endpoint.write_methods.clone(),
      mutation_markers: endpoint.mutation_markers.clone(),
      listener_markers: endpoint.listener_markers.clone(),
      data_files,
    }
  }

  /// First match wins:
  /// 1. write endpoint + write verb + mutation path → `RemoteWrite`
  ///    (any other traffic to the write endpoint passes through untouched);
  /// 2. known bulk-data file name → `DataFile`;
  /// 3. GET → `StaticAsset`;
  /// 4. everything else → `Passthrough`.
  pub fn classify(&self, request: &Request) -> RequestClass {
    if self.targets_write_endpoint(request) {
      let path = request.path();
      let is_write = self
        .write_methods
        .iter()
        .any(|m| m.eq_ignore_ascii_case(&request.method));
      let is_mutation = self.mutation_markers.iter().any(|m| path.contains(m));
      let is_listener = self.listener_markers.iter().any(|m| path.contains(m));

      if is_write && is_mutation && !is_listener {
        return RequestClass::RemoteWrite;
      }
      // Reads and listener channels on the write endpoint are neither
      // cacheable nor queueable.
      return RequestClass::Passthrough;
    }

    if self.data_files.iter().any(|f| request.url.ends_with(f)) {
      return RequestClass::DataFile;
    }

    if request.method.eq_ignore_ascii_case("GET") {
      return RequestClass::StaticAsset;
    }

    RequestClass::Passthrough
  }

  fn targets_write_endpoint(&self, request: &Request) -> bool {
    if self.write_host.is_empty() {
      return false;
    }
    Url::parse(&request.url)
      .ok()
      .and_then(|u| u.host_str().map(|h| h.contains(&self.write_host)))
      .unwrap_or(false)
  }
}

/// The interception layer: classifies and dispatches every request, and
/// always answers with a `Response` — raw network errors stop here.
pub struct Interceptor {
  rules: ClassifyRules,
  manager: CacheManager,
  engine: SyncEngine,
  net: Arc<dyn Network>,
}

impl Interceptor {
  pub fn new(
    rules: ClassifyRules,
    manager: CacheManager,
    engine: SyncEngine,
    net: Arc<dyn Network>,
  ) -> Self {
    Self {
      rules,
      manager,
      engine,
      net,
    }
  }

  pub async fn fetch(&self, request: Request) -> Response {
    match self.rules.classify(&request) {
      RequestClass::RemoteWrite => self.handle_remote_write(request).await,
      RequestClass::DataFile => self.manager.serve_data_file(&request).await,
      RequestClass::StaticAsset => self.manager.serve_static_asset(&request).await,
      RequestClass::Passthrough => self.forward(request).await,
    }
  }

  /// Network-first; on failure the snapshotted request is captured into the
  /// durable queue. The network gets its own clone of the request, so the
  /// snapshot handed to capture is never the copy the wire consumed.
  async fn handle_remote_write(&self, request: Request) -> Response {
    match self.net.fetch(request.clone()).await {
      Ok(response) if response.is_success() => response,
      Ok(response) => {
        debug!(url = %request.url, status = response.status, "Remote write rejected, queuing");
        self.capture_and_reply(&request)
      }
      Err(e) => {
        debug!(url = %request.url, "Remote write failed, queuing: {}", e);
        self.capture_and_reply(&request)
      }
    }
  }

  fn capture_and_reply(&self, request: &Request) -> Response {
    match self.engine.capture(request) {
      Ok(submission) => {
        info!(id = %submission.id, "Submission captured for sync");
        Response::offline_queued()
      }
      Err(e) => {
        // A submission we could neither send nor queue must surface as an
        // explicit failure, not a false acknowledgement.
        error!(url = %request.url, "Failed to queue submission: {}", e);
        Response::capture_failed(&e.to_string())
      }
    }
  }

  async fn forward(&self, request: Request) -> Response {
    let url = request.url.clone();
    match self.net.fetch(request).await {
      Ok(response) => response,
      Err(e) => {
        warn!(url = %url, "Passthrough request failed: {}", e);
        Response::json(503, &serde_json::json!({ "error": "Network unavailable" }))
      }
    }
  }
}
