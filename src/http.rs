//! Request and response values passed between the worker, the edge gate and
//! the network.
//!
//! These reuse reqwest's `Method`, `StatusCode` and `HeaderMap` so a response
//! from the wire can be stored and replayed without conversion.

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use url::Url;

/// How the page issued the request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
  /// Top-level page navigation
  Navigate,
  /// Subresource fetch (script, image, XHR...)
  #[default]
  Subresource,
}

#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub headers: HeaderMap,
  pub mode: RequestMode,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: HeaderMap::new(),
      mode: RequestMode::Subresource,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// A GET issued by a page navigation.
  pub fn navigate(url: Url) -> Self {
    Self {
      mode: RequestMode::Navigate,
      ..Self::get(url)
    }
  }

  pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
    self.headers.insert(name, value);
    self
  }

  pub fn path(&self) -> &str {
    self.url.path()
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate
  }

  /// Key used by the named caches. Only GETs are cached, so the URL alone
  /// identifies the entry.
  pub fn cache_key(&self) -> String {
    self.url.as_str().to_string()
  }

  /// Header value as a string, ignoring values that are not visible ASCII.
  pub fn header_str(&self, name: &str) -> Option<&str> {
    self.headers.get(name).and_then(|v| v.to_str().ok())
  }
}

#[derive(Debug, Clone)]
pub struct Response {
  pub status: StatusCode,
  pub headers: HeaderMap,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: HeaderMap::new(),
      body: body.into(),
    }
  }

  /// Plain-text response.
  pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
    Self::new(status, body.into()).with_header(
      CONTENT_TYPE,
      HeaderValue::from_static("text/plain; charset=utf-8"),
    )
  }

  /// JSON response. Serializing a `serde_json::Value` cannot fail.
  pub fn json(status: StatusCode, body: &serde_json::Value) -> Self {
    Self::new(status, body.to_string())
      .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
  }

  pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
    self.headers.insert(name, value);
    self
  }

  pub fn is_success(&self) -> bool {
    self.status.is_success()
  }

  pub fn body_text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// Serialize headers for storage as `[[name, value], ...]`.
pub fn headers_to_pairs(headers: &HeaderMap) -> Vec<(String, String)> {
  headers
    .iter()
    .filter_map(|(name, value)| {
      value
        .to_str()
        .ok()
        .map(|v| (name.as_str().to_string(), v.to_string()))
    })
    .collect()
}

/// Rebuild a header map from stored pairs, skipping anything invalid.
pub fn headers_from_pairs(pairs: &[(String, String)]) -> HeaderMap {
  let mut headers = HeaderMap::new();
  for (name, value) in pairs {
    if let (Ok(name), Ok(value)) = (
      HeaderName::from_bytes(name.as_bytes()),
      HeaderValue::from_str(value),
    ) {
      headers.append(name, value);
    }
  }
  headers
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_navigate_sets_mode() {
    let req = Request::navigate(Url::parse("https://app.test/dashboard").unwrap());
    assert!(req.is_navigation());
    assert_eq!(req.method, Method::GET);
    assert_eq!(req.path(), "/dashboard");
  }

  #[test]
  fn test_json_response_has_content_type() {
    let resp = Response::json(StatusCode::OK, &serde_json::json!({ "ok": true }));
    assert_eq!(resp.headers[CONTENT_TYPE], "application/json");
    assert_eq!(resp.body_text(), r#"{"ok":true}"#);
  }

  #[test]
  fn test_header_pairs_keep_repeated_values() {
    let mut headers = HeaderMap::new();
    headers.append("set-cookie", HeaderValue::from_static("a=1"));
    headers.append("set-cookie", HeaderValue::from_static("b=2"));

    let restored = headers_from_pairs(&headers_to_pairs(&headers));
    assert_eq!(restored.get_all("set-cookie").iter().count(), 2);
  }
}
