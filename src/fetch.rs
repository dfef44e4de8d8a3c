//! Request/response model and the network seam.
//!
//! Requests own their body as a value: the payload is snapshotted when the
//! request is built, so queueing a submission never races the network layer
//! over a half-consumed stream. The `Network` trait is the single place the
//! crate touches the wire, which keeps every policy above it testable.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

/// A boxed future returned by trait-object network backends.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// An outgoing HTTP request, headers and body snapshotted at build time.
#[derive(Debug, Clone)]
pub struct Request {
  pub url: String,
  pub method: String,
  pub headers: HashMap<String, String>,
  pub body: Option<String>,
}

impl Request {
  pub fn get(url: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      method: "GET".to_string(),
      headers: HashMap::new(),
      body: None,
    }
  }

  pub fn head(url: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      method: "HEAD".to_string(),
      headers: HashMap::new(),
      body: None,
    }
  }

  pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      method: "POST".to_string(),
      headers: HashMap::new(),
      body: Some(body.into()),
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }

  /// Path component of the URL, or the raw string when it does not parse.
  pub fn path(&self) -> String {
    url::Url::parse(&self.url)
      .map(|u| u.path().to_string())
      .unwrap_or_else(|_| self.url.clone())
  }
}

/// An HTTP response with the body fully read into memory.
#[derive(Debug, Clone)]
pub struct Response {
  pub status: u16,
  pub headers: HashMap<String, String>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Build a JSON response with the given status.
  pub fn json<T: Serialize>(status: u16, value: &T) -> Self {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"{}".to_vec());
    let mut headers = HashMap::new();
    headers.insert("content-type".to_string(), "application/json".to_string());
    Self {
      status,
      headers,
      body,
    }
  }

  /// Empty-list fallback for JSON data resources that cannot be served.
  pub fn empty_json_list() -> Self {
    Self::json(200, &Vec::<serde_json::Value>::new())
  }

  /// 503 for content that is neither cached nor reachable.
  pub fn unavailable(message: &str) -> Self {
    Self {
      status: 503,
      headers: HashMap::new(),
      body: message.as_bytes().to_vec(),
    }
  }

  /// Success-shaped reply for a submission that was queued instead of sent.
  /// The `offline` flag tells the foreground to show "queued", not "delivered".
  pub fn offline_queued() -> Self {
    Self::json(
      200,
      &serde_json::json!({
        "success": true,
        "offline": true,
        "message": "Survey queued for sync when online",
      }),
    )
  }

  /// Explicit failure reply when the submission could not even be queued.
  /// Distinct from `offline_queued` so the foreground can ask the user to retry.
  pub fn capture_failed(error: &str) -> Self {
    Self::json(
      500,
      &serde_json::json!({
        "success": false,
        "error": error,
      }),
    )
  }

  pub fn body_string(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// Network backend seam. The production implementation wraps `reqwest`;
/// tests swap in a stub with canned responses.
pub trait Network: Send + Sync {
  fn fetch(&self, request: Request) -> BoxFuture<Result<Response>>;
}

/// Shared connectivity state, updated by the worker's probe and read by
/// cache policies deciding whether a background refresh is worth spawning.
#[derive(Clone)]
pub struct OnlineFlag(std::sync::Arc<std::sync::atomic::AtomicBool>);

impl OnlineFlag {
  pub fn new(online: bool) -> Self {
    Self(std::sync::Arc::new(std::sync::atomic::AtomicBool::new(
      online,
    )))
  }

  pub fn is_online(&self) -> bool {
    self.0.load(std::sync::atomic::Ordering::Relaxed)
  }

  /// Returns the previous value, so callers can detect transitions.
  pub fn set_online(&self, online: bool) -> bool {
    self.0.swap(online, std::sync::atomic::Ordering::Relaxed)
  }
}

/// `reqwest`-backed network backend.
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .connect_timeout(std::time::Duration::from_secs(10))
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

impl Network for HttpNetwork {
  fn fetch(&self, request: Request) -> BoxFuture<Result<Response>> {
    let client = self.client.clone();

    Box::pin(async move {
      let method = reqwest::Method::from_bytes(request.method.as_bytes())
        .map_err(|e| eyre!("Invalid HTTP method {}: {}", request.method, e))?;

      let mut builder = client.request(method, &request.url);
      for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
      }
      if let Some(body) = request.body {
        builder = builder.body(body);
      }

      let response = builder
        .send()
        .await
        .map_err(|e| eyre!("Request to {} failed: {}", request.url, e))?;

      let status = response.status().as_u16();
      let headers = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
          value
            .to_str()
            .ok()
            .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
      let body = response
        .bytes()
        .await
        .map_err(|e| eyre!("Failed to read response from {}: {}", request.url, e))?
        .to_vec();

      Ok(Response {
        status,
        headers,
        body,
      })
    })
  }
}

#[cfg(test)]
pub mod testing {
  //! Canned-response network for tests.

  use super::*;
  use std::sync::Mutex;

  enum Canned {
    Reply(Response),
    Fail(String),
  }

  /// Stub network: one canned outcome per URL (the latest call to
  /// `respond*`/`fail` wins), plus a log of every request performed. A URL
  /// with no canned outcome behaves as unreachable.
  #[derive(Default)]
  pub struct StubNetwork {
    canned: Mutex<HashMap<String, Canned>>,
    requests: Mutex<Vec<Request>>,
  }

  impl StubNetwork {
    pub fn new() -> Self {
      Self::default()
    }

    /// Serve this response for the URL from now on.
    pub fn respond(&self, url: &str, response: Response) {
      self
        .canned
        .lock()
        .unwrap()
        .insert(url.to_string(), Canned::Reply(response));
    }

    pub fn respond_status(&self, url: &str, status: u16) {
      self.respond(
        url,
        Response {
          status,
          headers: HashMap::new(),
          body: Vec::new(),
        },
      );
    }

    pub fn respond_body(&self, url: &str, status: u16, body: &str) {
      self.respond(
        url,
        Response {
          status,
          headers: HashMap::new(),
          body: body.as_bytes().to_vec(),
        },
      );
    }

    /// Make the URL fail at the connection level from now on.
    pub fn fail(&self, url: &str) {
      self.canned.lock().unwrap().insert(
        url.to_string(),
        Canned::Fail(format!("stub: {} is unreachable", url)),
      );
    }

    /// Every request this network has seen, in order.
    pub fn seen(&self) -> Vec<Request> {
      self.requests.lock().unwrap().clone()
    }

    pub fn seen_count(&self, url: &str) -> usize {
      self
        .requests
        .lock()
        .unwrap()
        .iter()
        .filter(|r| r.url == url)
        .count()
    }
  }

  impl Network for StubNetwork {
    fn fetch(&self, request: Request) -> BoxFuture<Result<Response>> {
      self.requests.lock().unwrap().push(request.clone());

      let outcome = match self.canned.lock().unwrap().get(&request.url) {
        Some(Canned::Reply(response)) => Ok(response.clone()),
        Some(Canned::Fail(message)) => Err(eyre!(message.clone())),
        None => Err(eyre!("stub: no route for {}", request.url)),
      };

      Box::pin(async move { outcome })
    }
  }
}
