use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use url::Url;

const APP_DIR: &str = "permit-cache";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Upstream origin every relative path is resolved against
  pub origin: Url,
  pub cache: CacheConfig,
  pub routes: RouteConfig,
  pub edge: EdgeConfig,
  pub store: StoreConfig,
  pub network: NetworkConfig,
  pub logging: LoggingConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: Url::parse("http://localhost:3000").expect("static origin is valid"),
      cache: CacheConfig::default(),
      routes: RouteConfig::default(),
      edge: EdgeConfig::default(),
      store: StoreConfig::default(),
      network: NetworkConfig::default(),
      logging: LoggingConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Common prefix of the three cache names
  pub prefix: String,
  /// Version suffix; bump to invalidate every cache on next activation
  pub version: String,
  /// Paths precached on install
  pub manifest: Vec<String>,
  /// Activate right after install instead of waiting
  pub skip_waiting: bool,
  /// Background sync tag that triggers queued-action replay
  pub sync_tag: String,
  /// Database file, defaults to the data directory
  pub database: Option<PathBuf>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: "pr-business".to_string(),
      version: "v1".to_string(),
      manifest: vec![
        "/".to_string(),
        "/manifest.json".to_string(),
        "/favicon.ico".to_string(),
      ],
      skip_waiting: false,
      sync_tag: "sync-data".to_string(),
      database: None,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RouteConfig {
  pub api_prefix: String,
  /// File extensions served cache-first (case-insensitive, no dot)
  #[serde(deserialize_with = "deserialize_lowercase_vec")]
  pub static_extensions: Vec<String>,
  /// Path prefixes the edge treats as immutable build output
  pub static_prefixes: Vec<String>,
}

impl Default for RouteConfig {
  fn default() -> Self {
    Self {
      api_prefix: "/api/".to_string(),
      static_extensions: [
        "js", "css", "png", "jpg", "jpeg", "gif", "svg", "webp", "ico", "woff", "woff2", "ttf",
        "eot",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
      static_prefixes: vec!["/_next/static/".to_string()],
    }
  }
}

fn deserialize_lowercase_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(
    v.into_iter()
      .map(|s| s.trim_start_matches('.').to_lowercase())
      .collect(),
  )
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
  pub rate_limit: RateLimitConfig,
  /// Regexes matched against the user agent
  pub blocked_user_agents: Vec<String>,
  /// ISO country codes denied access (empty by default)
  pub blocked_countries: Vec<String>,
  /// Header carrying the resolved country code
  pub country_header: String,
  /// Max age for cached API responses
  pub api_cache_max_age_secs: u64,
  /// Cached API responses kept at most; the oldest goes first
  pub api_cache_max_entries: usize,
  pub static_cache_control: String,
  /// Overrides merged over the default security headers
  pub security_headers: BTreeMap<String, String>,
}

impl Default for EdgeConfig {
  fn default() -> Self {
    Self {
      rate_limit: RateLimitConfig::default(),
      blocked_user_agents: ["curl", "wget", "python-requests", "bot", "crawler", "spider"]
        .iter()
        .map(|p| format!("(?i){}", p))
        .collect(),
      blocked_countries: Vec::new(),
      country_header: "x-vercel-ip-country".to_string(),
      api_cache_max_age_secs: 60,
      api_cache_max_entries: 10_000,
      static_cache_control: "public, max-age=31536000, immutable".to_string(),
      security_headers: BTreeMap::new(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
  pub max_requests: u64,
  pub window_secs: u64,
  /// Expired counters are purged once this many clients are tracked
  pub max_tracked_clients: usize,
}

impl Default for RateLimitConfig {
  fn default() -> Self {
    Self {
      max_requests: 100,
      window_secs: 3600,
      max_tracked_clients: 10_000,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
  pub database: Option<PathBuf>,
  /// URL probed to decide connectivity, relative to the origin
  pub probe_path: Option<String>,
  /// Seconds between connectivity checks in `sync --watch`
  pub probe_interval_secs: u64,
}

impl Default for StoreConfig {
  fn default() -> Self {
    Self {
      database: None,
      probe_path: None,
      probe_interval_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
  /// Connect timeout for upstream fetches. Unset means no timeout at all.
  pub connect_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
  /// Default filter when RUST_LOG is unset
  pub level: String,
  /// Directory for daily-rotated log files
  pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: "info".to_string(),
      directory: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./permit-cache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/permit-cache/config.yaml
  ///
  /// Built-in defaults are used when no file is found.
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
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("permit-cache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join(APP_DIR).join("config.yaml");
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

  /// Resolve a path like `/api/permits` against the configured origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid path {}: {}", path, e))
  }

  pub fn cache_database(&self) -> Result<PathBuf> {
    match &self.cache.database {
      Some(p) => Ok(p.clone()),
      None => Ok(data_dir()?.join("cache.db")),
    }
  }

  pub fn store_database(&self) -> Result<PathBuf> {
    match &self.store.database {
      Some(p) => Ok(p.clone()),
      None => Ok(data_dir()?.join("store.db")),
    }
  }
}

fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join(APP_DIR))
}
