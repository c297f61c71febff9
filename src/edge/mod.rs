//! Request gate in front of the upstream origin.
//!
//! Every request is counted against its client's fixed window, checked
//! against the user-agent and country blocklists, and then forwarded.
//! Successful API responses are cached briefly, static build output gets an
//! immutable cache-control header, and every response leaves with the full
//! security header set.

mod blocking;
mod headers;
mod rate_limit;
mod response_cache;

use reqwest::header::{HeaderName, HeaderValue, AUTHORIZATION, CACHE_CONTROL, RETRY_AFTER};
use reqwest::{Method, StatusCode};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{EdgeConfig, RouteConfig};
use crate::fetch::NetworkFetcher;
use crate::http::{Request, Response};
use crate::worker::RouteRules;
use color_eyre::{eyre::eyre, Result};

pub use blocking::RequestBlocker;
pub use headers::SecurityHeaders;
pub use rate_limit::{client_id, RateDecision, RateLimiter};
pub use response_cache::EdgeResponseCache;

/// Marks responses served from the edge cache.
const EDGE_CACHE_HEADER: &str = "x-edge-cache";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EdgePath {
  Api,
  Static,
  Other,
}

pub struct EdgeMiddleware<N: NetworkFetcher> {
  next: Arc<N>,
  security: SecurityHeaders,
  limiter: RateLimiter,
  blocker: RequestBlocker,
  cache: EdgeResponseCache,
  rules: RouteRules,
  static_prefixes: Vec<String>,
  static_cache_control: HeaderValue,
}

impl<N: NetworkFetcher> EdgeMiddleware<N> {
  pub fn from_config(edge: &EdgeConfig, routes: &RouteConfig, next: Arc<N>) -> Result<Self> {
    let static_cache_control = HeaderValue::from_str(&edge.static_cache_control)
      .map_err(|e| eyre!("Invalid static cache-control value: {}", e))?;

    Ok(Self {
      next,
      security: SecurityHeaders::with_overrides(&edge.security_headers)?,
      limiter: RateLimiter::from_config(&edge.rate_limit),
      blocker: RequestBlocker::from_config(edge)?,
      cache: EdgeResponseCache::new(Duration::from_secs(edge.api_cache_max_age_secs))
        .with_max_entries(edge.api_cache_max_entries),
      rules: RouteRules::from_config(routes),
      static_prefixes: routes.static_prefixes.clone(),
      static_cache_control,
    })
  }

  pub async fn handle(&self, request: &Request) -> Response {
    self.handle_at(request, Instant::now()).await
  }

  /// Gate one request as if it arrived at `now`. Never fails: denials and
  /// upstream errors become responses.
  pub async fn handle_at(&self, request: &Request, now: Instant) -> Response {
    let mut response = self.route(request, now).await;
    self.security.apply(&mut response.headers);
    response
  }

  async fn route(&self, request: &Request, now: Instant) -> Response {
    let client = client_id(request);

    match self.limiter.check_at(&client, now) {
      Ok(RateDecision::Allowed { .. }) => {}
      Ok(RateDecision::Limited { retry_after }) => {
        tracing::info!(client = %client, path = request.path(), "rate limited");
        return Response::text(StatusCode::TOO_MANY_REQUESTS, "Too Many Requests")
          .with_header(RETRY_AFTER, HeaderValue::from(retry_after.as_secs()));
      }
      Err(e) => tracing::warn!(error = %e, "rate limiter unavailable, admitting request"),
    }

    if let Some(reason) = self.blocker.check(request) {
      tracing::info!(client = %client, reason = ?reason, "blocked");
      return Response::text(StatusCode::FORBIDDEN, "Forbidden");
    }

    match self.classify(request) {
      EdgePath::Api => self.cached_api(request, now).await,
      EdgePath::Static => {
        let mut response = self.forward(request).await;
        if response.status == StatusCode::OK {
          response
            .headers
            .insert(CACHE_CONTROL, self.static_cache_control.clone());
        }
        response
      }
      EdgePath::Other => self.forward(request).await,
    }
  }

  fn classify(&self, request: &Request) -> EdgePath {
    let path = request.path();
    if self.rules.is_api(path) {
      EdgePath::Api
    } else if self.static_prefixes.iter().any(|p| path.starts_with(p))
      || self.rules.is_static_asset(path)
    {
      EdgePath::Static
    } else {
      EdgePath::Other
    }
  }

  /// Credentialed requests bypass the shared cache entirely.
  async fn cached_api(&self, request: &Request, now: Instant) -> Response {
    let cacheable = (request.method == Method::GET || request.method == Method::HEAD)
      && !request.headers.contains_key(AUTHORIZATION);
    if !cacheable {
      return self.forward(request).await;
    }

    let key = EdgeResponseCache::key_for(request);
    if let Some(mut hit) = self.cache.get(&key, now) {
      hit.headers.insert(
        HeaderName::from_static(EDGE_CACHE_HEADER),
        HeaderValue::from_static("HIT"),
      );
      return hit;
    }

    let response = self.forward(request).await;
    self.cache.put(key, &response, now);
    response
  }

  async fn forward(&self, request: &Request) -> Response {
    match self.next.fetch(request).await {
      Ok(response) => response,
      Err(e) => {
        tracing::warn!(url = %request.url, error = %e, "upstream unavailable");
        Response::text(StatusCode::BAD_GATEWAY, "Bad Gateway")
      }
    }
  }
}
