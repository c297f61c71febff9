//! Security headers attached to every edge response.

use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::BTreeMap;

const DEFAULT_HEADERS: &[(&str, &str)] = &[
  (
    "content-security-policy",
    "default-src 'self'; script-src 'self' 'unsafe-inline' 'unsafe-eval'; \
     style-src 'self' 'unsafe-inline'; img-src 'self' data: https:; \
     font-src 'self' data:; connect-src 'self' https:; frame-ancestors 'none'",
  ),
  (
    "strict-transport-security",
    "max-age=31536000; includeSubDomains; preload",
  ),
  ("x-frame-options", "DENY"),
  ("x-content-type-options", "nosniff"),
  ("referrer-policy", "strict-origin-when-cross-origin"),
  (
    "permissions-policy",
    "camera=(), microphone=(), geolocation=(self)",
  ),
];

/// Opaque name/value set applied over any response headers.
#[derive(Debug, Clone)]
pub struct SecurityHeaders {
  headers: Vec<(HeaderName, HeaderValue)>,
}

impl SecurityHeaders {
  /// Defaults merged with configured overrides. An override with an empty
  /// value removes that header.
  pub fn with_overrides(overrides: &BTreeMap<String, String>) -> Result<Self> {
    let mut merged: BTreeMap<String, String> = DEFAULT_HEADERS
      .iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect();

    for (name, value) in overrides {
      let name = name.to_lowercase();
      if value.is_empty() {
        merged.remove(&name);
      } else {
        merged.insert(name, value.clone());
      }
    }

    let headers = merged
      .into_iter()
      .map(|(name, value)| {
        let header_name = HeaderName::from_bytes(name.as_bytes())
          .map_err(|e| eyre!("Invalid security header name {}: {}", name, e))?;
        let header_value = HeaderValue::from_str(&value)
          .map_err(|e| eyre!("Invalid value for security header {}: {}", name, e))?;
        Ok((header_name, header_value))
      })
      .collect::<Result<Vec<_>>>()?;

    Ok(Self { headers })
  }

  pub fn apply(&self, headers: &mut HeaderMap) {
    for (name, value) in &self.headers {
      headers.insert(name.clone(), value.clone());
    }
  }

  #[cfg(test)]
  pub fn names(&self) -> impl Iterator<Item = &HeaderName> {
    self.headers.iter().map(|(name, _)| name)
  }
}

impl Default for SecurityHeaders {
  fn default() -> Self {
    let headers = DEFAULT_HEADERS
      .iter()
      .map(|(name, value)| {
        (
          HeaderName::from_static(name),
          HeaderValue::from_static(value),
        )
      })
      .collect();
    Self { headers }
  }
}
