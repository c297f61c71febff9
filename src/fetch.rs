//! Network capability used by the worker strategies and as the upstream of
//! the edge gate.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;

use crate::config::Config;
use crate::http::{Request, Response};

/// Anything that can turn a request into a response over the network.
///
/// An `Err` means the network was unreachable. A response with an error
/// status (404, 500...) is still `Ok`, exactly like a browser `fetch`.
#[async_trait]
pub trait NetworkFetcher: Send + Sync + 'static {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// reqwest-backed fetcher.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(config: &Config) -> Result<Self> {
    let mut builder = reqwest::Client::builder()
      .user_agent(concat!("permit-cache/", env!("CARGO_PKG_VERSION")))
      .redirect(reqwest::redirect::Policy::limited(5));

    if let Some(secs) = config.network.connect_timeout_secs {
      builder = builder.connect_timeout(Duration::from_secs(secs));
    }

    let client = builder
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl NetworkFetcher for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let response = self
      .client
      .request(request.method.clone(), request.url.clone())
      .headers(request.headers.clone())
      .send()
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", request.url, e))?;

    let status = response.status();
    let headers = response.headers().clone();
    let body = response
      .bytes()
      .await
      .map_err(|e| eyre!("Failed to read body of {}: {}", request.url, e))?;

    tracing::debug!(url = %request.url, status = status.as_u16(), "fetched");

    Ok(Response {
      status,
      headers,
      body: body.to_vec(),
    })
  }
}
