//! In-memory fakes for the capability traits.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use url::Url;

use crate::fetch::NetworkFetcher;
use crate::http::{Request, Response};
use crate::worker::{Notification, Notifier, SyncReplay};

pub const ORIGIN: &str = "https://portal.test";

pub fn url(path: &str) -> Url {
  Url::parse(ORIGIN).unwrap().join(path).unwrap()
}

/// Fake network keyed by path. Unknown paths answer 404.
#[derive(Default)]
pub struct FakeNetwork {
  routes: Mutex<HashMap<String, Response>>,
  offline: AtomicBool,
  calls: AtomicUsize,
  gate: Option<Arc<Notify>>,
}

impl FakeNetwork {
  pub fn new() -> Self {
    Self::default()
  }

  /// Every fetch waits for `gate.notify_one()` before answering.
  pub fn gated(gate: Arc<Notify>) -> Self {
    Self {
      gate: Some(gate),
      ..Self::default()
    }
  }

  pub fn serve(&self, path: &str, response: Response) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(path.to_string(), response);
  }

  pub fn serve_text(&self, path: &str, body: &str) {
    self.serve(path, Response::text(StatusCode::OK, body));
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl NetworkFetcher for FakeNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    if let Some(gate) = &self.gate {
      gate.notified().await;
    }
    if self.offline.load(Ordering::SeqCst) {
      return Err(eyre!("network unreachable"));
    }
    let routes = self.routes.lock().unwrap();
    Ok(
      routes
        .get(request.path())
        .cloned()
        .unwrap_or_else(|| Response::text(StatusCode::NOT_FOUND, "not found")),
    )
  }
}

#[derive(Default)]
pub struct RecordingNotifier {
  pub shown: Mutex<Vec<Notification>>,
}

impl Notifier for RecordingNotifier {
  fn show(&self, notification: &Notification) {
    self.shown.lock().unwrap().push(notification.clone());
  }
}

#[derive(Default)]
pub struct CountingReplay {
  pub runs: AtomicUsize,
}

#[async_trait]
impl SyncReplay for CountingReplay {
  async fn replay(&self) -> Result<()> {
    self.runs.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }
}
