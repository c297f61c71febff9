//! Core types for the named response caches.

use chrono::{DateTime, Utc};

use crate::http::Response;

/// A response read back from a named cache.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: Response,
  /// When the entry was written. Informational only, nothing expires on it.
  pub cached_at: DateTime<Utc>,
}

/// Indicates where a response handed to the page came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  /// Fresh from the network
  Network,
  /// Served from cache without consulting the network first
  Cache,
  /// Network unavailable, serving a cached copy
  Offline,
  /// Network unavailable and nothing cached, built locally
  Synthesized,
}

impl ResponseSource {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Network => "network",
      Self::Cache => "cache",
      Self::Offline => "offline",
      Self::Synthesized => "synthesized",
    }
  }
}

/// The versioned set of cache names owned by one worker generation.
///
/// All three carry the same version suffix; bumping it invalidates every
/// entry of the previous generation on the next activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNames {
  pub static_assets: String,
  pub api: String,
  pub pages: String,
}

impl CacheNames {
  pub fn versioned(prefix: &str, version: &str) -> Self {
    Self {
      static_assets: format!("{}-static-{}", prefix, version),
      api: format!("{}-api-{}", prefix, version),
      pages: format!("{}-pages-{}", prefix, version),
    }
  }

  pub fn all(&self) -> [&str; 3] {
    [&self.static_assets, &self.api, &self.pages]
  }

  pub fn contains(&self, name: &str) -> bool {
    self.all().contains(&name)
  }
}
