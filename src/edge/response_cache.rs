//! Short-lived cache for successful API responses at the edge.

use reqwest::header::{HeaderValue, CACHE_CONTROL};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::http::{Request, Response};

/// Request headers that change the representation and so the cache key.
/// Credentialed requests never reach this cache.
const VARY_HEADERS: &[&str] = &["accept", "accept-language"];

struct Entry {
  response: Response,
  stored_at: Instant,
}

struct Entries {
  map: HashMap<String, Entry>,
  /// Earliest moment the next sweep of expired entries may run
  next_sweep: Option<Instant>,
}

pub struct EdgeResponseCache {
  max_age: Duration,
  max_entries: usize,
  entries: Mutex<Entries>,
}

impl EdgeResponseCache {
  pub fn new(max_age: Duration) -> Self {
    Self {
      max_age,
      max_entries: 10_000,
      entries: Mutex::new(Entries {
        map: HashMap::new(),
        next_sweep: None,
      }),
    }
  }

  /// Upper bound on stored responses; the oldest entry is evicted beyond it.
  pub fn with_max_entries(mut self, max_entries: usize) -> Self {
    self.max_entries = max_entries.max(1);
    self
  }

  /// Stable key over method, full URL and the vary headers.
  pub fn key_for(request: &Request) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request.method.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(request.url.as_str().as_bytes());
    for name in VARY_HEADERS {
      hasher.update(b"\n");
      hasher.update(name.as_bytes());
      hasher.update(b":");
      if let Some(value) = request.headers.get(*name) {
        hasher.update(value.as_bytes());
      }
    }
    hex::encode(hasher.finalize())
  }

  /// Fresh entry for `key`; expired entries are dropped on the way.
  pub fn get(&self, key: &str, now: Instant) -> Option<Response> {
    let mut entries = self.entries.lock().ok()?;
    let fresh = entries
      .map
      .get(key)
      .map(|entry| self.is_fresh(entry, now))?;

    if fresh {
      entries.map.get(key).map(|entry| entry.response.clone())
    } else {
      entries.map.remove(key);
      None
    }
  }

  /// Store a 200 response. Anything else is ignored.
  ///
  /// Expired entries are swept at most once per max-age, or whenever the
  /// cache is full; if it is still full the oldest entry makes room.
  pub fn put(&self, key: String, response: &Response, now: Instant) {
    if response.status != StatusCode::OK {
      return;
    }

    let mut stored = response.clone();
    let cache_control = format!("public, s-maxage={}", self.max_age.as_secs());
    if let Ok(value) = HeaderValue::from_str(&cache_control) {
      stored.headers.insert(CACHE_CONTROL, value);
    }

    let mut entries = match self.entries.lock() {
      Ok(entries) => entries,
      Err(e) => {
        tracing::warn!(error = %e, "edge cache unavailable");
        return;
      }
    };

    let full = entries.map.len() >= self.max_entries && !entries.map.contains_key(&key);
    let sweep_due = entries.next_sweep.map_or(true, |at| now >= at);
    if full || sweep_due {
      let before = entries.map.len();
      entries.map.retain(|_, entry| self.is_fresh(entry, now));
      entries.next_sweep = Some(now + self.max_age);
      tracing::trace!(removed = before - entries.map.len(), "swept edge cache");
    }

    if entries.map.len() >= self.max_entries && !entries.map.contains_key(&key) {
      let oldest = entries
        .map
        .iter()
        .min_by_key(|(_, entry)| entry.stored_at)
        .map(|(k, _)| k.clone());
      if let Some(oldest) = oldest {
        entries.map.remove(&oldest);
      }
    }

    entries.map.insert(
      key,
      Entry {
        response: stored,
        stored_at: now,
      },
    );
  }

  fn is_fresh(&self, entry: &Entry, now: Instant) -> bool {
    now.saturating_duration_since(entry.stored_at) < self.max_age
  }

  #[cfg(test)]
  pub fn len(&self) -> usize {
    self.entries.lock().map(|e| e.map.len()).unwrap_or(0)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::url;
  use reqwest::header::ACCEPT_LANGUAGE;

  #[test]
  fn test_key_varies_on_language() {
    let en = Request::get(url("/api/permits"))
      .with_header(ACCEPT_LANGUAGE, HeaderValue::from_static("en"));
    let es = Request::get(url("/api/permits"))
      .with_header(ACCEPT_LANGUAGE, HeaderValue::from_static("es"));
    assert_ne!(EdgeResponseCache::key_for(&en), EdgeResponseCache::key_for(&es));
    assert_eq!(
      EdgeResponseCache::key_for(&en),
      EdgeResponseCache::key_for(&en.clone())
    );
  }

  #[test]
  fn test_entries_expire_after_max_age() {
    let cache = EdgeResponseCache::new(Duration::from_secs(60));
    let now = Instant::now();
    cache.put("k".to_string(), &Response::text(StatusCode::OK, "x"), now);

    let hit = cache.get("k", now + Duration::from_secs(59)).unwrap();
    assert_eq!(hit.headers[CACHE_CONTROL], "public, s-maxage=60");
    assert!(cache.get("k", now + Duration::from_secs(60)).is_none());
    assert_eq!(cache.len(), 0);
  }

  #[test]
  fn test_expired_entries_are_swept_on_put() {
    let cache = EdgeResponseCache::new(Duration::from_secs(60));
    let start = Instant::now();
    for i in 0..500 {
      cache.put(format!("/api/permits/{}", i), &Response::text(StatusCode::OK, "x"), start);
    }
    assert_eq!(cache.len(), 500);

    let later = start + Duration::from_secs(3600);
    for i in 0..10 {
      cache.put(format!("/api/documents/{}", i), &Response::text(StatusCode::OK, "y"), later);
    }
    assert_eq!(cache.len(), 10);
  }

  #[test]
  fn test_full_cache_evicts_oldest() {
    let cache = EdgeResponseCache::new(Duration::from_secs(60)).with_max_entries(2);
    let start = Instant::now();
    let ok = Response::text(StatusCode::OK, "x");
    cache.put("a".to_string(), &ok, start);
    cache.put("b".to_string(), &ok, start + Duration::from_secs(1));
    cache.put("c".to_string(), &ok, start + Duration::from_secs(2));

    assert_eq!(cache.len(), 2);
    assert!(cache.get("a", start + Duration::from_secs(3)).is_none());
    assert!(cache.get("b", start + Duration::from_secs(3)).is_some());
    assert!(cache.get("c", start + Duration::from_secs(3)).is_some());
  }

  #[test]
  fn test_only_200_is_stored() {
    let cache = EdgeResponseCache::new(Duration::from_secs(60));
    let now = Instant::now();
    cache.put("k".to_string(), &Response::text(StatusCode::CREATED, "x"), now);
    cache.put("k".to_string(), &Response::text(StatusCode::NOT_FOUND, "x"), now);
    assert!(cache.get("k", now).is_none());
  }
}
