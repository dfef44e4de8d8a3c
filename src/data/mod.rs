//! Typed access to the three bulk datasets.
//!
//! Stations, communes and streets are loaded through the interception
//! layer, so the bulk-data cache policy (cache-first, background refresh,
//! empty fallback) applies to every load. Each dataset is read once per
//! process; a payload that is missing or malformed degrades to an empty
//! dataset instead of an error.

use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::config::Config;
use crate::fetch::Request;
use crate::router::Interceptor;

pub const DEFAULT_SEARCH_LIMIT: usize = 100;
/// Queries shorter than this return nothing.
pub const MIN_QUERY_LEN: usize = 2;

/// A station entry. The source file mixes plain names with records keyed
/// `"Nom Gare"`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum Gare {
  Record {
    #[serde(rename = "Nom Gare")]
    nom: String,
  },
  Name(String),
}

impl Gare {
  pub fn name(&self) -> &str {
    match self {
      Gare::Record { nom } => nom,
      Gare::Name(name) => name,
    }
  }
}

/// A commune with its postal code. Postal codes appear both as strings and
/// as bare numbers in the source file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Commune {
  #[serde(rename = "COMMUNE", default)]
  pub commune: String,
  #[serde(rename = "CODE POSTAL", default, deserialize_with = "string_or_number")]
  pub code_postal: String,
}

fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
  D: Deserializer<'de>,
{
  let value = serde_json::Value::deserialize(deserializer)?;
  match value {
    serde_json::Value::String(s) => Ok(s),
    serde_json::Value::Number(n) => Ok(n.to_string()),
    serde_json::Value::Null => Ok(String::new()),
    other => Err(serde::de::Error::custom(format!(
      "expected string or number for postal code, got {}",
      other
    ))),
  }
}

/// Absolute URLs of the three bulk-data files.
#[derive(Debug, Clone)]
pub struct DataUrls {
  pub gares: String,
  pub communes: String,
  pub streets: String,
}

impl DataUrls {
  /// The manifest lists the files in fixed order: stations, communes,
  /// streets.
  pub fn from_config(config: &Config) -> color_eyre::Result<Self> {
    let urls = config.data_file_urls();
    match urls.as_slice() {
      [gares, communes, streets] => Ok(Self {
        gares: gares.clone(),
        communes: communes.clone(),
        streets: streets.clone(),
      }),
      other => Err(color_eyre::eyre::eyre!(
        "Expected 3 data files in the manifest, found {}",
        other.len()
      )),
    }
  }
}

/// Lazily loaded, memoized datasets with search helpers.
pub struct Datasets {
  interceptor: Arc<Interceptor>,
  urls: DataUrls,
  gares: OnceCell<Vec<Gare>>,
  communes: OnceCell<Vec<Commune>>,
  streets: OnceCell<Vec<String>>,
}

impl Datasets {
  pub fn new(interceptor: Arc<Interceptor>, urls: DataUrls) -> Self {
    Self {
      interceptor,
      urls,
      gares: OnceCell::new(),
      communes: OnceCell::new(),
      streets: OnceCell::new(),
    }
  }

  pub async fn gares(&self) -> &[Gare] {
    self
      .gares
      .get_or_init(|| fetch_list(&self.interceptor, &self.urls.gares, "gares"))
      .await
  }

  pub async fn communes(&self) -> &[Commune] {
    self
      .communes
      .get_or_init(|| fetch_list(&self.interceptor, &self.urls.communes, "communes"))
      .await
  }

  pub async fn streets(&self) -> &[String] {
    self
      .streets
      .get_or_init(|| fetch_list(&self.interceptor, &self.urls.streets, "streets"))
      .await
  }

  /// Case-insensitive substring search on station names.
  pub async fn search_gares(&self, query: &str, limit: usize) -> Vec<Gare> {
    if too_short(query) {
      return Vec::new();
    }
    let term = query.to_lowercase();

    self
      .gares()
      .await
      .iter()
      .filter(|g| g.name().to_lowercase().contains(&term))
      .take(limit)
      .cloned()
      .collect()
  }

  /// Commune substring + postal-code prefix search. Either criterion may be
  /// empty, but at least one must reach the minimum query length.
  pub async fn search_communes(
    &self,
    commune_query: &str,
    postal_query: &str,
    limit: usize,
  ) -> Vec<Commune> {
    if too_short(commune_query) && too_short(postal_query) {
      return Vec::new();
    }
    let commune_term = commune_query.to_lowercase();

    self
      .communes()
      .await
      .iter()
      .filter(|c| {
        let commune_match =
          commune_query.is_empty() || c.commune.to_lowercase().contains(&commune_term);
        let postal_match = postal_query.is_empty() || c.code_postal.starts_with(postal_query);
        commune_match && postal_match
      })
      .take(limit)
      .cloned()
      .collect()
  }

  /// Case-insensitive substring search on street names.
  pub async fn search_streets(&self, query: &str, limit: usize) -> Vec<String> {
    if too_short(query) {
      return Vec::new();
    }
    let term = query.to_lowercase();

    self
      .streets()
      .await
      .iter()
      .filter(|s| s.to_lowercase().contains(&term))
      .take(limit)
      .cloned()
      .collect()
  }
}

fn too_short(query: &str) -> bool {
  query.chars().count() < MIN_QUERY_LEN
}

/// Load one dataset through the interception layer. Anything that is not a
/// decodable JSON array degrades to an empty dataset.
async fn fetch_list<T: DeserializeOwned>(
  interceptor: &Interceptor,
  url: &str,
  label: &str,
) -> Vec<T> {
  let response = interceptor.fetch(Request::get(url)).await;
  if !response.is_success() {
    warn!(url = %url, status = response.status, "Failed to load {}", label);
    return Vec::new();
  }

  match serde_json::from_slice::<Vec<T>>(&response.body) {
    Ok(list) => {
      info!(count = list.len(), "Loaded {}", label);
      list
    }
    Err(e) => {
      warn!(url = %url, "Invalid data format for {}: {}", label, e);
      Vec::new()
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheManager, SqliteCacheStore};
  use crate::config::EndpointConfig;
  use crate::fetch::testing::StubNetwork;
  use crate::fetch::OnlineFlag;
  use crate::router::ClassifyRules;
  use crate::store::SqliteQueueStore;
  use crate::sync::SyncEngine;

  const GARES_URL: &str = "https://survey.example.com/gare.json";
  const COMMUNES_URL: &str = "https://survey.example.com/output.json";
  const STREETS_URL: &str = "https://survey.example.com/streets.json";

  fn datasets(net: Arc<StubNetwork>) -> Datasets {
    let cache = Arc::new(SqliteCacheStore::open_in_memory().unwrap());
    let queue = Arc::new(SqliteQueueStore::open_in_memory().unwrap());
    let manager = CacheManager::new(
      cache,
      net.clone(),
      OnlineFlag::new(true),
      "carnet-static-v1",
      "carnet-data-v1",
    );
    let engine = SyncEngine::new(queue, net.clone());
    let rules = ClassifyRules::new(
      &EndpointConfig::for_host("firestore.example.com"),
      vec![
        "gare.json".to_string(),
        "output.json".to_string(),
        "streets.json".to_string(),
      ],
    );
    let interceptor = Arc::new(Interceptor::new(rules, manager, engine, net));

    Datasets::new(
      interceptor,
      DataUrls {
        gares: GARES_URL.to_string(),
        communes: COMMUNES_URL.to_string(),
        streets: STREETS_URL.to_string(),
      },
    )
  }

  #[tokio::test]
  async fn gares_mix_plain_names_and_records() {
    let net = Arc::new(StubNetwork::new());
    net.respond_body(
      GARES_URL,
      200,
      r#"[{"Nom Gare": "Auray"}, "Vannes", {"Nom Gare": "Lamballe-Armor"}]"#,
    );
    let data = datasets(net);

    let hits = data.search_gares("au", DEFAULT_SEARCH_LIMIT).await;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].name(), "Auray");

    let hits = data.search_gares("an", DEFAULT_SEARCH_LIMIT).await;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].name(), "Vannes");
  }

  #[tokio::test]
  async fn short_queries_return_nothing() {
    let net = Arc::new(StubNetwork::new());
    net.respond_body(GARES_URL, 200, r#"["Auray"]"#);
    let data = datasets(net);

    assert!(data.search_gares("a", DEFAULT_SEARCH_LIMIT).await.is_empty());
    assert!(data.search_gares("", DEFAULT_SEARCH_LIMIT).await.is_empty());
  }

  #[tokio::test]
  async fn commune_search_combines_name_and_postal_prefix() {
    let net = Arc::new(StubNetwork::new());
    net.respond_body(
      COMMUNES_URL,
      200,
      r#"[
        {"COMMUNE": "Auray", "CODE POSTAL": "56400"},
        {"COMMUNE": "Brech", "CODE POSTAL": 56400},
        {"COMMUNE": "Vannes", "CODE POSTAL": "56000"}
      ]"#,
    );
    let data = datasets(net);

    // Postal prefix alone; numeric codes match like strings.
    let hits = data.search_communes("", "564", DEFAULT_SEARCH_LIMIT).await;
    assert_eq!(hits.len(), 2);

    // Name alone, case-insensitive.
    let hits = data
      .search_communes("VAnn", "", DEFAULT_SEARCH_LIMIT)
      .await;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].commune, "Vannes");

    // Both criteria must hold together.
    let hits = data
      .search_communes("au", "56000", DEFAULT_SEARCH_LIMIT)
      .await;
    assert!(hits.is_empty());
  }

  #[tokio::test]
  async fn results_are_capped() {
    let net = Arc::new(StubNetwork::new());
    let many: Vec<String> = (0..150).map(|i| format!("rue des Lilas {}", i)).collect();
    net.respond_body(STREETS_URL, 200, &serde_json::to_string(&many).unwrap());
    let data = datasets(net);

    let hits = data.search_streets("lilas", DEFAULT_SEARCH_LIMIT).await;
    assert_eq!(hits.len(), DEFAULT_SEARCH_LIMIT);
  }

  #[tokio::test]
  async fn network_down_degrades_to_empty_dataset() {
    let net = Arc::new(StubNetwork::new());
    net.fail(STREETS_URL);
    let data = datasets(net);

    // The cache fallback turns the failure into an empty list; the search
    // simply finds nothing.
    let hits = data.search_streets("lilas", DEFAULT_SEARCH_LIMIT).await;
    assert!(hits.is_empty());
  }

  #[tokio::test]
  async fn malformed_payload_degrades_to_empty_dataset() {
    let net = Arc::new(StubNetwork::new());
    net.respond_body(GARES_URL, 200, r#"{"not": "an array"}"#);
    let data = datasets(net.clone());

    assert!(data.search_gares("au", DEFAULT_SEARCH_LIMIT).await.is_empty());
    // The failed load is memoized like a successful one; no refetch storm.
    assert_eq!(net.seen_count(GARES_URL), 1);
  }
}
