use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the survey app's assets are served from, e.g. "https://survey.example.com".
  pub app_origin: String,
  pub endpoint: EndpointConfig,
  #[serde(default)]
  pub manifests: ManifestsConfig,
  #[serde(default)]
  pub caches: CachesConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  /// Question-graph JSON consumed by the `flow` subcommands.
  pub questions_file: Option<PathBuf>,
  /// Override for the directory holding queue.db and cache.db.
  pub data_dir: Option<PathBuf>,
}

/// The remote write endpoint and the rules that recognize its traffic.
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
  /// Substring matched against request hosts.
  pub host: String,
  /// Full URL survey submissions are posted to.
  pub submit_url: String,
  #[serde(default = "default_write_methods")]
  pub write_methods: Vec<String>,
  /// Path substrings marking a document mutation.
  #[serde(default = "default_mutation_markers")]
  pub mutation_markers: Vec<String>,
  /// Path substrings marking a realtime listener channel.
  #[serde(default = "default_listener_markers")]
  pub listener_markers: Vec<String>,
}

#[cfg(test)]
impl EndpointConfig {
  /// Endpoint with default rules for a host.
  pub fn for_host(host: &str) -> Self {
    Self {
      host: host.to_string(),
      submit_url: format!("https://{}/v1/documents/surveys", host),
      write_methods: default_write_methods(),
      mutation_markers: default_mutation_markers(),
      listener_markers: default_listener_markers(),
    }
  }
}

fn default_write_methods() -> Vec<String> {
  ["POST", "PATCH", "PUT", "DELETE"]
    .map(String::from)
    .to_vec()
}

fn default_mutation_markers() -> Vec<String> {
  vec!["/documents".to_string()]
}

fn default_listener_markers() -> Vec<String> {
  vec!["/Listen".to_string(), "/channel".to_string()]
}

/// The two asset manifests, as app-origin-relative paths.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestsConfig {
  #[serde(default = "default_static_assets")]
  pub static_assets: Vec<String>,
  #[serde(default = "default_data_files")]
  pub data_files: Vec<String>,
}

impl Default for ManifestsConfig {
  fn default() -> Self {
    Self {
      static_assets: default_static_assets(),
      data_files: default_data_files(),
    }
  }
}

fn default_static_assets() -> Vec<String> {
  ["/", "/index.html", "/manifest.json", "/vite.svg", "/plan.png"]
    .map(String::from)
    .to_vec()
}

fn default_data_files() -> Vec<String> {
  ["/gare.json", "/output.json", "/streets.json"]
    .map(String::from)
    .to_vec()
}

/// Versioned cache generation names.
#[derive(Debug, Clone, Deserialize)]
pub struct CachesConfig {
  #[serde(default = "default_static_cache")]
  pub static_name: String,
  #[serde(default = "default_data_cache")]
  pub data_name: String,
}

impl Default for CachesConfig {
  fn default() -> Self {
    Self {
      static_name: default_static_cache(),
      data_name: default_data_cache(),
    }
  }
}

fn default_static_cache() -> String {
  "carnet-static-v1".to_string()
}

fn default_data_cache() -> String {
  "carnet-data-v1".to_string()
}

/// Drain and connectivity-probe cadence.
#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  #[serde(default = "default_drain_interval")]
  pub drain_interval_secs: u64,
  #[serde(default = "default_probe_interval")]
  pub probe_interval_secs: u64,
  /// URL probed to detect connectivity; defaults to the app origin.
  pub probe_url: Option<String>,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      drain_interval_secs: default_drain_interval(),
      probe_interval_secs: default_probe_interval(),
      probe_url: None,
    }
  }
}

fn default_drain_interval() -> u64 {
  60
}

fn default_probe_interval() -> u64 {
  15
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./carnet.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/carnet/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/carnet/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("carnet.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("carnet").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    let config: Config = serde_yaml::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;

    Ok(config)
  }

  /// Absolute URL for an app-origin-relative path.
  pub fn app_url(&self, path: &str) -> String {
    format!("{}{}", self.app_origin.trim_end_matches('/'), path)
  }

  pub fn static_asset_urls(&self) -> Vec<String> {
    self
      .manifests
      .static_assets
      .iter()
      .map(|p| self.app_url(p))
      .collect()
  }

  pub fn data_file_urls(&self) -> Vec<String> {
    self
      .manifests
      .data_files
      .iter()
      .map(|p| self.app_url(p))
      .collect()
  }

  /// Bare file names of the bulk-data files, for request classification.
  pub fn data_file_names(&self) -> Vec<String> {
    self
      .manifests
      .data_files
      .iter()
      .map(|p| p.rsplit('/').next().unwrap_or(p).to_string())
      .collect()
  }

  pub fn probe_url(&self) -> String {
    self
      .sync
      .probe_url
      .clone()
      .unwrap_or_else(|| self.app_url("/"))
  }

  fn data_home(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("carnet"))
  }

  pub fn queue_db_path(&self) -> Result<PathBuf> {
    Ok(self.data_home()?.join("queue.db"))
  }

  pub fn cache_db_path(&self) -> Result<PathBuf> {
    Ok(self.data_home()?.join("cache.db"))
  }

  pub fn log_dir(&self) -> Result<PathBuf> {
    Ok(self.data_home()?.join("logs"))
  }
}
