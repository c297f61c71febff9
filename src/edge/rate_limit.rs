//! Fixed-window request counting per client.
//!
//! The first request from a client opens a window; every request increments
//! the counter, and once it exceeds the threshold the client is refused
//! until the window expires. Bursts straddling a window boundary can reach
//! twice the threshold; that is accepted behavior.

use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;
use crate::http::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
  Allowed { remaining: u64 },
  Limited { retry_after: Duration },
}

#[derive(Debug, Clone, Copy)]
struct WindowCounter {
  count: u64,
  expires_at: Instant,
}

struct Counters {
  by_client: HashMap<String, WindowCounter>,
  /// A full table is purged at most once per window
  next_purge: Option<Instant>,
}

pub struct RateLimiter {
  max_requests: u64,
  window: Duration,
  max_tracked: usize,
  counters: Mutex<Counters>,
}

impl RateLimiter {
  pub fn new(max_requests: u64, window: Duration) -> Self {
    Self {
      max_requests,
      window,
      max_tracked: 10_000,
      counters: Mutex::new(Counters {
        by_client: HashMap::new(),
        next_purge: None,
      }),
    }
  }

  pub fn from_config(config: &RateLimitConfig) -> Self {
    Self::new(config.max_requests, Duration::from_secs(config.window_secs))
      .with_max_tracked(config.max_tracked_clients)
  }

  /// Purge expired counters once this many clients are tracked.
  pub fn with_max_tracked(mut self, max_tracked: usize) -> Self {
    self.max_tracked = max_tracked;
    self
  }

  /// Count one request from `client` at `now`.
  pub fn check_at(&self, client: &str, now: Instant) -> Result<RateDecision> {
    let mut counters = self
      .counters
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let purge_due = counters.next_purge.map_or(true, |at| now >= at);
    if counters.by_client.len() >= self.max_tracked && purge_due {
      counters.by_client.retain(|_, c| c.expires_at > now);
      counters.next_purge = Some(now + self.window);
    }

    let window = self.window;
    let counter = counters
      .by_client
      .entry(format!("rate_limit:{}", client))
      .or_insert(WindowCounter {
        count: 0,
        expires_at: now + window,
      });

    if counter.expires_at <= now {
      *counter = WindowCounter {
        count: 0,
        expires_at: now + window,
      };
    }
    counter.count += 1;

    if counter.count > self.max_requests {
      Ok(RateDecision::Limited {
        retry_after: counter.expires_at.saturating_duration_since(now),
      })
    } else {
      Ok(RateDecision::Allowed {
        remaining: self.max_requests - counter.count,
      })
    }
  }

  /// Number of clients with a counter, expired or not.
  #[cfg(test)]
  pub fn tracked_clients(&self) -> usize {
    self.counters.lock().map(|c| c.by_client.len()).unwrap_or(0)
  }
}

/// Client identity: first hop of `x-forwarded-for`, then `x-real-ip`,
/// then `unknown`.
pub fn client_id(request: &Request) -> String {
  request
    .header_str("x-forwarded-for")
    .and_then(|v| v.split(',').next())
    .map(str::trim)
    .filter(|v| !v.is_empty())
    .or_else(|| {
      request
        .header_str("x-real-ip")
        .map(str::trim)
        .filter(|v| !v.is_empty())
    })
    .unwrap_or("unknown")
    .to_string()
}
