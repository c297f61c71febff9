//! Request classification and the three caching strategies.

use color_eyre::Result;
use reqwest::{Method, StatusCode};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;

use crate::cache::{CacheNames, CachedResponse, KeyedCache, ResponseSource};
use crate::config::RouteConfig;
use crate::fetch::NetworkFetcher;
use crate::http::{Request, Response};

/// Shape of an intercepted request; decides the strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
  Api,
  StaticAsset,
  Navigation,
  Other,
}

impl RequestKind {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Api => "api",
      Self::StaticAsset => "static",
      Self::Navigation => "navigation",
      Self::Other => "other",
    }
  }
}

/// Path rules shared by the worker and the edge gate.
#[derive(Debug, Clone)]
pub struct RouteRules {
  api_prefix: String,
  static_extensions: HashSet<String>,
}

impl RouteRules {
  pub fn new<I, S>(api_prefix: &str, static_extensions: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      api_prefix: api_prefix.to_string(),
      static_extensions: static_extensions
        .into_iter()
        .map(|e| e.into().to_lowercase())
        .collect(),
    }
  }

  pub fn from_config(config: &RouteConfig) -> Self {
    Self::new(&config.api_prefix, config.static_extensions.iter().cloned())
  }

  pub fn is_api(&self, path: &str) -> bool {
    path.starts_with(&self.api_prefix)
  }

  pub fn is_static_asset(&self, path: &str) -> bool {
    let last_segment = path.rsplit('/').next().unwrap_or("");
    match last_segment.rsplit_once('.') {
      Some((stem, ext)) if !stem.is_empty() => {
        self.static_extensions.contains(&ext.to_lowercase())
      }
      _ => false,
    }
  }

  /// First match wins: API prefix, static extension, navigation, other.
  pub fn classify(&self, request: &Request) -> RequestKind {
    let path = request.path();
    if self.is_api(path) {
      RequestKind::Api
    } else if self.is_static_asset(path) {
      RequestKind::StaticAsset
    } else if request.is_navigation() {
      RequestKind::Navigation
    } else {
      RequestKind::Other
    }
  }
}

/// The response chosen for an intercepted request.
#[derive(Debug)]
pub struct HandledResponse {
  pub response: Response,
  pub source: ResponseSource,
  pub kind: RequestKind,
  /// Background refresh started by stale-while-revalidate. It keeps running
  /// after the cached response is returned; awaiting it is optional.
  pub revalidation: Option<JoinHandle<Result<Response>>>,
}

impl HandledResponse {
  fn new(kind: RequestKind, response: Response, source: ResponseSource) -> Self {
    Self {
      response,
      source,
      kind,
      revalidation: None,
    }
  }
}

/// Applies a caching strategy per request kind.
///
/// Every path resolves to a response: network failures fall back to cache or
/// to a synthesized 503, and cache failures are treated as misses.
pub struct CacheRouter<C: KeyedCache, F: NetworkFetcher> {
  cache: Arc<C>,
  network: Arc<F>,
  names: CacheNames,
  rules: RouteRules,
}

impl<C: KeyedCache, F: NetworkFetcher> CacheRouter<C, F> {
  pub fn new(cache: Arc<C>, network: Arc<F>, names: CacheNames, rules: RouteRules) -> Self {
    Self {
      cache,
      network,
      names,
      rules,
    }
  }

  pub fn names(&self) -> &CacheNames {
    &self.names
  }

  pub fn cache(&self) -> &Arc<C> {
    &self.cache
  }

  pub fn network(&self) -> &Arc<F> {
    &self.network
  }

  /// Resolve a request. Returns `None` for non-GET requests, which are
  /// left to the caller untouched.
  pub async fn handle(&self, request: &Request) -> Option<HandledResponse> {
    if request.method != Method::GET {
      return None;
    }

    let kind = self.rules.classify(request);
    tracing::debug!(url = %request.url, kind = kind.as_str(), "intercepted");

    let handled = match kind {
      RequestKind::Api => self.network_first(request).await,
      RequestKind::StaticAsset => self.cache_first(request).await,
      RequestKind::Navigation => self.stale_while_revalidate(request).await,
      RequestKind::Other => self.network_with_fallback(request).await,
    };
    Some(handled)
  }

  /// Network first, api cache as fallback, JSON 503 as last resort.
  async fn network_first(&self, request: &Request) -> HandledResponse {
    let kind = RequestKind::Api;
    let key = request.cache_key();

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          store(self.cache.as_ref(), &self.names.api, &key, &response);
        }
        HandledResponse::new(kind, response, ResponseSource::Network)
      }
      Err(e) => {
        tracing::warn!(url = %request.url, error = %e, "network failed, trying api cache");
        match lookup(self.cache.as_ref(), &self.names.api, &key) {
          Some(cached) => HandledResponse::new(kind, cached.response, ResponseSource::Offline),
          None => HandledResponse::new(kind, offline_api_response(), ResponseSource::Synthesized),
        }
      }
    }
  }

  /// Cache first, network on miss, text 503 when both fail.
  async fn cache_first(&self, request: &Request) -> HandledResponse {
    let kind = RequestKind::StaticAsset;
    let key = request.cache_key();

    if let Some(cached) = lookup(self.cache.as_ref(), &self.names.static_assets, &key) {
      return HandledResponse::new(kind, cached.response, ResponseSource::Cache);
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          store(self.cache.as_ref(), &self.names.static_assets, &key, &response);
        }
        HandledResponse::new(kind, response, ResponseSource::Network)
      }
      Err(e) => {
        tracing::warn!(url = %request.url, error = %e, "static asset unavailable offline");
        HandledResponse::new(
          kind,
          offline_text_response("Offline - asset not available"),
          ResponseSource::Synthesized,
        )
      }
    }
  }

  /// Serve the cached page at once while a background fetch refreshes it.
  async fn stale_while_revalidate(&self, request: &Request) -> HandledResponse {
    let kind = RequestKind::Navigation;
    let key = request.cache_key();

    let refresh = tokio::spawn(revalidate(
      Arc::clone(&self.cache),
      Arc::clone(&self.network),
      self.names.pages.clone(),
      request.clone(),
    ));

    if let Some(cached) = lookup(self.cache.as_ref(), &self.names.pages, &key) {
      return HandledResponse {
        response: cached.response,
        source: ResponseSource::Cache,
        kind,
        revalidation: Some(refresh),
      };
    }

    match refresh.await {
      Ok(Ok(response)) => HandledResponse::new(kind, response, ResponseSource::Network),
      Ok(Err(e)) => {
        tracing::warn!(url = %request.url, error = %e, "navigation failed, serving app shell");
        self.app_shell(request)
      }
      Err(e) => {
        tracing::warn!(url = %request.url, error = %e, "revalidation task failed");
        self.app_shell(request)
      }
    }
  }

  /// Plain network fetch; any cache is consulted only on network error.
  async fn network_with_fallback(&self, request: &Request) -> HandledResponse {
    let kind = RequestKind::Other;

    match self.network.fetch(request).await {
      Ok(response) => HandledResponse::new(kind, response, ResponseSource::Network),
      Err(e) => {
        tracing::warn!(url = %request.url, error = %e, "network failed, searching caches");
        let cached = self
          .cache
          .lookup_any(&request.cache_key())
          .unwrap_or_else(|e| {
            tracing::warn!(error = %e, "cache lookup failed");
            None
          });
        match cached {
          Some(cached) => HandledResponse::new(kind, cached.response, ResponseSource::Offline),
          None => HandledResponse::new(
            kind,
            offline_text_response("Offline"),
            ResponseSource::Synthesized,
          ),
        }
      }
    }
  }

  /// The precached root document, or a text 503 when even that is missing.
  fn app_shell(&self, request: &Request) -> HandledResponse {
    let kind = RequestKind::Navigation;
    let shell = request
      .url
      .join("/")
      .ok()
      .and_then(|root| lookup(self.cache.as_ref(), &self.names.static_assets, root.as_str()));

    match shell {
      Some(cached) => HandledResponse::new(kind, cached.response, ResponseSource::Offline),
      None => HandledResponse::new(
        kind,
        offline_text_response("Offline"),
        ResponseSource::Synthesized,
      ),
    }
  }
}

impl<C: KeyedCache, F: NetworkFetcher> Clone for CacheRouter<C, F> {
  fn clone(&self) -> Self {
    Self {
      cache: Arc::clone(&self.cache),
      network: Arc::clone(&self.network),
      names: self.names.clone(),
      rules: self.rules.clone(),
    }
  }
}

async fn revalidate<C: KeyedCache, F: NetworkFetcher>(
  cache: Arc<C>,
  network: Arc<F>,
  cache_name: String,
  request: Request,
) -> Result<Response> {
  let response = network.fetch(&request).await?;
  if response.is_success() {
    store(cache.as_ref(), &cache_name, &request.cache_key(), &response);
  }
  Ok(response)
}

/// Cache read that treats storage errors as a miss.
fn lookup<C: KeyedCache>(cache: &C, cache_name: &str, key: &str) -> Option<CachedResponse> {
  cache.lookup(cache_name, key).unwrap_or_else(|e| {
    tracing::warn!(cache = cache_name, error = %e, "cache read failed");
    None
  })
}

/// Cache write whose failure never reaches the caller.
fn store<C: KeyedCache>(cache: &C, cache_name: &str, key: &str, response: &Response) {
  if let Err(e) = cache.put(cache_name, key, response) {
    tracing::warn!(cache = cache_name, error = %e, "cache write failed");
  }
}

pub fn offline_api_response() -> Response {
  Response::json(
    StatusCode::SERVICE_UNAVAILABLE,
    &serde_json::json!({
      "error": "Offline",
      "message": "No network connection. Cached data is not available for this request.",
    }),
  )
}

fn offline_text_response(message: &str) -> Response {
  Response::text(StatusCode::SERVICE_UNAVAILABLE, message)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteCacheStorage;
  use crate::testing::{url, FakeNetwork};
  use color_eyre::eyre::eyre;
  use std::sync::Arc;
  use tokio::sync::Notify;

  fn rules() -> RouteRules {
    RouteRules::from_config(&RouteConfig::default())
  }

  fn names() -> CacheNames {
    CacheNames::versioned("test", "v1")
  }

  fn router(network: FakeNetwork) -> CacheRouter<SqliteCacheStorage, FakeNetwork> {
    CacheRouter::new(
      Arc::new(SqliteCacheStorage::in_memory().unwrap()),
      Arc::new(network),
      names(),
      rules(),
    )
  }

  #[test]
  fn test_classify_first_match_wins() {
    let rules = rules();
    assert_eq!(rules.classify(&Request::get(url("/api/permits"))), RequestKind::Api);
    assert_eq!(rules.classify(&Request::get(url("/api/logo.png"))), RequestKind::Api);
    assert_eq!(
      rules.classify(&Request::get(url("/img/Logo.PNG"))),
      RequestKind::StaticAsset
    );
    assert_eq!(
      rules.classify(&Request::navigate(url("/theme.css"))),
      RequestKind::StaticAsset
    );
    assert_eq!(
      rules.classify(&Request::navigate(url("/dashboard"))),
      RequestKind::Navigation
    );
    assert_eq!(rules.classify(&Request::get(url("/manifest.json"))), RequestKind::Other);
  }

  #[test]
  fn test_dotfile_is_not_static() {
    assert!(!rules().is_static_asset("/.js"));
    assert!(!rules().is_static_asset("/scripts.d/readme"));
  }

  #[tokio::test]
  async fn test_non_get_passes_through() {
    let router = router(FakeNetwork::new());
    let post = Request::new(Method::POST, url("/api/businesses"));
    assert!(router.handle(&post).await.is_none());
    assert_eq!(router.network().calls(), 0);
  }

  #[tokio::test]
  async fn test_static_asset_served_from_cache_when_offline() {
    let network = FakeNetwork::new();
    network.serve_text("/app.js", "console.log(1)");
    let router = router(network);
    let request = Request::get(url("/app.js"));

    let first = router.handle(&request).await.unwrap();
    assert_eq!(first.source, ResponseSource::Network);

    router.network().set_offline(true);
    let second = router.handle(&request).await.unwrap();
    assert_eq!(second.source, ResponseSource::Cache);
    assert_eq!(second.response.status, StatusCode::OK);
    assert_eq!(second.response.body_text(), "console.log(1)");
    assert_eq!(router.network().calls(), 1);
  }

  #[tokio::test]
  async fn test_static_asset_miss_offline_is_503_text() {
    let network = FakeNetwork::new();
    network.set_offline(true);
    let router = router(network);

    let handled = router.handle(&Request::get(url("/logo.svg"))).await.unwrap();
    assert_eq!(handled.response.status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(handled.source, ResponseSource::Synthesized);
    assert!(handled.response.headers["content-type"]
      .to_str()
      .unwrap()
      .starts_with("text/plain"));
  }

  #[tokio::test]
  async fn test_static_error_status_not_cached() {
    let router = router(FakeNetwork::new());
    let request = Request::get(url("/missing.css"));

    let handled = router.handle(&request).await.unwrap();
    assert_eq!(handled.response.status, StatusCode::NOT_FOUND);
    assert!(router
      .cache()
      .lookup(&names().static_assets, &request.cache_key())
      .unwrap()
      .is_none());
  }

  #[tokio::test]
  async fn test_api_falls_back_to_cached_copy() {
    let network = FakeNetwork::new();
    network.serve(
      "/api/permits",
      Response::json(StatusCode::OK, &serde_json::json!([{ "id": 1 }])),
    );
    let router = router(network);
    let request = Request::get(url("/api/permits"));

    router.handle(&request).await.unwrap();
    router.network().set_offline(true);

    let handled = router.handle(&request).await.unwrap();
    assert_eq!(handled.source, ResponseSource::Offline);
    assert_eq!(handled.response.status, StatusCode::OK);
    assert_eq!(handled.response.body_text(), r#"[{"id":1}]"#);
  }

  #[tokio::test]
  async fn test_api_offline_without_cache_is_json_503() {
    let network = FakeNetwork::new();
    network.set_offline(true);
    let router = router(network);

    let handled = router.handle(&Request::get(url("/api/permits"))).await.unwrap();
    assert_eq!(handled.response.status, StatusCode::SERVICE_UNAVAILABLE);
    let body: serde_json::Value = serde_json::from_slice(&handled.response.body).unwrap();
    assert_eq!(body["error"], "Offline");
    assert!(body["message"].is_string());
  }

  #[tokio::test]
  async fn test_api_server_error_is_returned_but_not_cached() {
    let network = FakeNetwork::new();
    network.serve(
      "/api/permits",
      Response::text(StatusCode::INTERNAL_SERVER_ERROR, "boom"),
    );
    let router = router(network);
    let request = Request::get(url("/api/permits"));

    let handled = router.handle(&request).await.unwrap();
    assert_eq!(handled.response.status, StatusCode::INTERNAL_SERVER_ERROR);

    router.network().set_offline(true);
    let handled = router.handle(&request).await.unwrap();
    assert_eq!(handled.source, ResponseSource::Synthesized);
  }

  #[tokio::test]
  async fn test_navigation_returns_cache_without_waiting_for_network() {
    let gate = Arc::new(Notify::new());
    let network = FakeNetwork::gated(Arc::clone(&gate));
    network.serve_text("/dashboard", "fresh");
    let router = router(network);
    let request = Request::navigate(url("/dashboard"));

    router
      .cache()
      .put(
        &names().pages,
        &request.cache_key(),
        &Response::text(StatusCode::OK, "stale"),
      )
      .unwrap();

    // The gate is closed, so this only returns if the network is not awaited.
    let handled = router.handle(&request).await.unwrap();
    assert_eq!(handled.source, ResponseSource::Cache);
    assert_eq!(handled.response.body_text(), "stale");

    gate.notify_one();
    let refreshed = handled.revalidation.unwrap().await.unwrap().unwrap();
    assert_eq!(refreshed.body_text(), "fresh");
    assert_eq!(router.network().calls(), 1);

    let cached = router
      .cache()
      .lookup(&names().pages, &request.cache_key())
      .unwrap()
      .unwrap();
    assert_eq!(cached.response.body_text(), "fresh");
  }

  #[tokio::test]
  async fn test_navigation_without_cache_waits_for_network() {
    let network = FakeNetwork::new();
    network.serve_text("/permits", "page");
    let router = router(network);

    let handled = router.handle(&Request::navigate(url("/permits"))).await.unwrap();
    assert_eq!(handled.source, ResponseSource::Network);
    assert_eq!(handled.response.body_text(), "page");
    assert!(handled.revalidation.is_none());
  }

  #[tokio::test]
  async fn test_navigation_offline_serves_app_shell() {
    let network = FakeNetwork::new();
    network.set_offline(true);
    let router = router(network);
    router
      .cache()
      .put(
        &names().static_assets,
        url("/").as_str(),
        &Response::text(StatusCode::OK, "shell"),
      )
      .unwrap();

    let handled = router.handle(&Request::navigate(url("/documents"))).await.unwrap();
    assert_eq!(handled.source, ResponseSource::Offline);
    assert_eq!(handled.response.body_text(), "shell");
  }

  #[tokio::test]
  async fn test_navigation_offline_without_shell_is_503() {
    let network = FakeNetwork::new();
    network.set_offline(true);
    let router = router(network);

    let handled = router.handle(&Request::navigate(url("/documents"))).await.unwrap();
    assert_eq!(handled.response.status, StatusCode::SERVICE_UNAVAILABLE);
  }

  #[tokio::test]
  async fn test_other_request_searches_every_cache_offline() {
    let network = FakeNetwork::new();
    network.set_offline(true);
    let router = router(network);
    let request = Request::get(url("/manifest.json"));
    router
      .cache()
      .put(
        &names().static_assets,
        &request.cache_key(),
        &Response::text(StatusCode::OK, "{}"),
      )
      .unwrap();

    let handled = router.handle(&request).await.unwrap();
    assert_eq!(handled.source, ResponseSource::Offline);
    assert_eq!(handled.response.body_text(), "{}");
  }

  struct BrokenCache;

  impl KeyedCache for BrokenCache {
    fn open(&self, _cache_name: &str) -> Result<()> {
      Err(eyre!("quota exceeded"))
    }
    fn lookup(&self, _cache_name: &str, _key: &str) -> Result<Option<CachedResponse>> {
      Err(eyre!("corrupted"))
    }
    fn lookup_any(&self, _key: &str) -> Result<Option<CachedResponse>> {
      Err(eyre!("corrupted"))
    }
    fn put(&self, _cache_name: &str, _key: &str, _response: &Response) -> Result<()> {
      Err(eyre!("quota exceeded"))
    }
    fn cache_names(&self) -> Result<Vec<String>> {
      Ok(Vec::new())
    }
    fn delete_cache(&self, _cache_name: &str) -> Result<bool> {
      Ok(false)
    }
  }

  #[tokio::test]
  async fn test_cache_failures_do_not_block_network_response() {
    let network = FakeNetwork::new();
    network.serve_text("/api/settings", "ok");
    network.serve_text("/app.css", "body{}");
    let router = CacheRouter::new(Arc::new(BrokenCache), Arc::new(network), names(), rules());

    let api = router.handle(&Request::get(url("/api/settings"))).await.unwrap();
    assert_eq!(api.response.body_text(), "ok");

    let css = router.handle(&Request::get(url("/app.css"))).await.unwrap();
    assert_eq!(css.response.body_text(), "body{}");

    router.network().set_offline(true);
    let offline = router.handle(&Request::get(url("/api/settings"))).await.unwrap();
    assert_eq!(offline.response.status, StatusCode::SERVICE_UNAVAILABLE);
  }
}
