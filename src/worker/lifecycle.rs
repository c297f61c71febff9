//! Worker lifecycle: install, activate, and event dispatch.

use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::sync::Arc;
use url::Url;

use super::events::{LogNotifier, NoopReplay, Notification, Notifier, SyncReplay};
use super::router::{CacheRouter, HandledResponse};
use crate::cache::KeyedCache;
use crate::fetch::NetworkFetcher;
use crate::http::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
  Parsed,
  Installing,
  /// Installed and waiting for the previous worker to finish
  Installed,
  Activating,
  Activated,
  /// Install failed; this worker will never control a page
  Redundant,
}

/// Messages a page can post to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
  SkipWaiting,
}

pub struct ServiceWorker<C: KeyedCache, F: NetworkFetcher> {
  router: CacheRouter<C, F>,
  /// Origin the worker controls
  scope: Url,
  /// Absolute URLs precached on install
  manifest: Vec<Url>,
  sync_tag: String,
  skip_waiting: bool,
  state: WorkerState,
  controls_clients: bool,
  replay: Arc<dyn SyncReplay>,
  notifier: Arc<dyn Notifier>,
}

impl<C: KeyedCache, F: NetworkFetcher> ServiceWorker<C, F> {
  pub fn new(router: CacheRouter<C, F>, scope: Url, manifest: Vec<Url>, sync_tag: &str) -> Self {
    Self {
      router,
      scope,
      manifest,
      sync_tag: sync_tag.to_string(),
      skip_waiting: false,
      state: WorkerState::Parsed,
      controls_clients: false,
      replay: Arc::new(NoopReplay),
      notifier: Arc::new(LogNotifier),
    }
  }

  /// Activate right after install instead of waiting.
  pub fn with_skip_waiting(mut self, skip_waiting: bool) -> Self {
    self.skip_waiting = skip_waiting;
    self
  }

  pub fn with_replay(mut self, replay: Arc<dyn SyncReplay>) -> Self {
    self.replay = replay;
    self
  }

  pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
    self.notifier = notifier;
    self
  }

  pub fn state(&self) -> WorkerState {
    self.state
  }

  pub fn controls_clients(&self) -> bool {
    self.controls_clients
  }

  pub fn router(&self) -> &CacheRouter<C, F> {
    &self.router
  }

  /// Precache the manifest into the static cache.
  ///
  /// Every manifest entry must fetch with a 2xx status and be stored,
  /// otherwise the worker becomes redundant and the error is returned.
  pub async fn install(&mut self) -> Result<()> {
    self.state = WorkerState::Installing;

    if let Err(e) = self.precache().await {
      self.state = WorkerState::Redundant;
      tracing::error!(error = %e, "install failed");
      return Err(e);
    }

    self.state = WorkerState::Installed;
    tracing::info!(
      assets = self.manifest.len(),
      cache = %self.router.names().static_assets,
      "installed"
    );

    if self.skip_waiting {
      self.activate()?;
    }
    Ok(())
  }

  async fn precache(&self) -> Result<()> {
    let cache = self.router.cache();
    let network = self.router.network();
    let static_name = &self.router.names().static_assets;

    cache.open(static_name)?;

    let requests: Vec<Request> = self.manifest.iter().cloned().map(Request::get).collect();

    // Fetch everything before storing anything so a failed install leaves
    // no partial manifest behind.
    let responses = futures::future::try_join_all(requests.iter().map(|request| async move {
      let response = network.fetch(request).await?;
      if !response.is_success() {
        return Err(eyre!(
          "Precache of {} failed with status {}",
          request.url,
          response.status
        ));
      }
      Ok::<_, color_eyre::Report>((request, response))
    }))
    .await?;

    for (request, response) in responses {
      cache.put(static_name, &request.cache_key(), &response)?;
    }
    Ok(())
  }

  /// Drop every cache outside the current versioned set, then take control
  /// of open pages. Returns the names that were deleted.
  pub fn activate(&mut self) -> Result<Vec<String>> {
    if self.state != WorkerState::Installed {
      return Err(eyre!("Cannot activate worker in state {:?}", self.state));
    }
    self.state = WorkerState::Activating;

    let cache = self.router.cache();
    let names = self.router.names();

    let existing = cache.cache_names().unwrap_or_else(|e| {
      tracing::warn!(error = %e, "could not enumerate caches");
      Vec::new()
    });

    let mut deleted = Vec::new();
    for name in existing.into_iter().filter(|n| !names.contains(n)) {
      match cache.delete_cache(&name) {
        Ok(_) => {
          tracing::info!(cache = %name, "deleted old cache");
          deleted.push(name);
        }
        Err(e) => tracing::warn!(cache = %name, error = %e, "failed to delete old cache"),
      }
    }

    self.controls_clients = true;
    self.state = WorkerState::Activated;
    tracing::info!(deleted = deleted.len(), "activated");

    Ok(deleted)
  }

  /// Resolve an intercepted fetch. `None` means the request is not handled
  /// by the worker (non-GET).
  pub async fn handle_fetch(&self, request: &Request) -> Option<HandledResponse> {
    self.router.handle(request).await
  }

  /// Background sync. Returns whether the tag was recognized.
  pub async fn handle_sync(&self, tag: &str) -> bool {
    if tag != self.sync_tag {
      tracing::debug!(tag, "ignoring unknown sync tag");
      return false;
    }

    if let Err(e) = self.replay.replay().await {
      tracing::warn!(error = %e, "queued action replay failed");
    }
    true
  }

  /// Show a push notification. Missing or malformed payloads are ignored.
  pub fn handle_push(&self, payload: Option<&[u8]>) -> Option<Notification> {
    let notification = Notification::from_payload(payload?)?;
    self.notifier.show(&notification);
    Some(notification)
  }

  /// URL a clicked notification opens, resolved against the worker scope.
  pub fn handle_notification_click(&self, notification: &Notification) -> Result<Url> {
    self
      .scope
      .join(notification.target())
      .map_err(|e| eyre!("Invalid notification target {}: {}", notification.target(), e))
  }

  pub fn handle_message(&mut self, message: WorkerMessage) -> Result<()> {
    match message {
      WorkerMessage::SkipWaiting => {
        self.skip_waiting = true;
        if self.state == WorkerState::Installed {
          self.activate()?;
        }
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheNames, SqliteCacheStorage};
  use crate::config::RouteConfig;
  use crate::http::Response;
  use crate::testing::{url, CountingReplay, FakeNetwork, RecordingNotifier};
  use crate::worker::RouteRules;
  use reqwest::StatusCode;
  use std::sync::atomic::Ordering;

  fn worker_with(
    cache: Arc<SqliteCacheStorage>,
    network: FakeNetwork,
    version: &str,
  ) -> ServiceWorker<SqliteCacheStorage, FakeNetwork> {
    let router = CacheRouter::new(
      cache,
      Arc::new(network),
      CacheNames::versioned("pr", version),
      RouteRules::from_config(&RouteConfig::default()),
    );
    let manifest = vec![url("/"), url("/manifest.json"), url("/favicon.ico")];
    ServiceWorker::new(router, url("/"), manifest, "sync-data")
  }

  fn full_site() -> FakeNetwork {
    let network = FakeNetwork::new();
    network.serve_text("/", "<html>shell</html>");
    network.serve_text("/manifest.json", "{}");
    network.serve("/favicon.ico", Response::new(StatusCode::OK, vec![0u8, 1, 2]));
    network
  }

  #[tokio::test]
  async fn test_install_precaches_manifest() {
    let cache = Arc::new(SqliteCacheStorage::in_memory().unwrap());
    let mut worker = worker_with(Arc::clone(&cache), full_site(), "v1");

    worker.install().await.unwrap();
    assert_eq!(worker.state(), WorkerState::Installed);
    assert!(!worker.controls_clients());

    for path in ["/", "/manifest.json", "/favicon.ico"] {
      assert!(cache
        .lookup("pr-static-v1", url(path).as_str())
        .unwrap()
        .is_some());
    }
  }

  #[tokio::test]
  async fn test_install_failure_is_fatal() {
    let network = FakeNetwork::new();
    network.serve_text("/", "shell");
    // manifest.json and favicon answer 404
    let cache = Arc::new(SqliteCacheStorage::in_memory().unwrap());
    let mut worker = worker_with(Arc::clone(&cache), network, "v1");

    assert!(worker.install().await.is_err());
    assert_eq!(worker.state(), WorkerState::Redundant);
    assert!(cache.lookup("pr-static-v1", url("/").as_str()).unwrap().is_none());
    assert!(worker.activate().is_err());
  }

  #[tokio::test]
  async fn test_activate_requires_install() {
    let cache = Arc::new(SqliteCacheStorage::in_memory().unwrap());
    let mut worker = worker_with(cache, full_site(), "v1");
    assert!(worker.activate().is_err());
    assert_eq!(worker.state(), WorkerState::Parsed);
  }

  #[tokio::test]
  async fn test_version_bump_deletes_only_old_caches() {
    let cache = Arc::new(SqliteCacheStorage::in_memory().unwrap());
    for name in ["pr-static-v1", "pr-api-v1", "pr-pages-v1", "unrelated"] {
      cache.open(name).unwrap();
    }

    let mut worker = worker_with(Arc::clone(&cache), full_site(), "v2");
    worker.install().await.unwrap();
    cache.open("pr-api-v2").unwrap();

    let mut deleted = worker.activate().unwrap();
    deleted.sort();
    assert_eq!(
      deleted,
      vec!["pr-api-v1", "pr-pages-v1", "pr-static-v1", "unrelated"]
    );

    let remaining = cache.cache_names().unwrap();
    assert_eq!(remaining, vec!["pr-static-v2", "pr-api-v2"]);
    assert_eq!(worker.state(), WorkerState::Activated);
    assert!(worker.controls_clients());
  }

  #[tokio::test]
  async fn test_skip_waiting_activates_on_install() {
    let cache = Arc::new(SqliteCacheStorage::in_memory().unwrap());
    let mut worker = worker_with(cache, full_site(), "v1").with_skip_waiting(true);

    worker.install().await.unwrap();
    assert_eq!(worker.state(), WorkerState::Activated);
  }

  #[tokio::test]
  async fn test_skip_waiting_message_activates_installed_worker() {
    let cache = Arc::new(SqliteCacheStorage::in_memory().unwrap());
    let mut worker = worker_with(cache, full_site(), "v1");
    worker.install().await.unwrap();

    let message: WorkerMessage = serde_json::from_str(r#"{"type":"SKIP_WAITING"}"#).unwrap();
    worker.handle_message(message).unwrap();
    assert_eq!(worker.state(), WorkerState::Activated);
  }

  #[tokio::test]
  async fn test_sync_runs_replay_for_known_tag_only() {
    let cache = Arc::new(SqliteCacheStorage::in_memory().unwrap());
    let replay = Arc::new(CountingReplay::default());
    let worker = worker_with(cache, full_site(), "v1").with_replay(replay.clone());

    assert!(worker.handle_sync("sync-data").await);
    assert!(!worker.handle_sync("other-tag").await);
    assert_eq!(replay.runs.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_push_shows_notification() {
    let cache = Arc::new(SqliteCacheStorage::in_memory().unwrap());
    let notifier = Arc::new(RecordingNotifier::default());
    let worker = worker_with(cache, full_site(), "v1").with_notifier(notifier.clone());

    let shown = worker
      .handle_push(Some(
        br#"{"title":"Permit Update","body":"Your permit was approved"}"#,
      ))
      .unwrap();
    assert_eq!(shown.title, "Permit Update");

    let recorded = notifier.shown.lock().unwrap();
    assert_eq!(recorded.len(), 1);
    assert_eq!(recorded[0].title, "Permit Update");
  }

  #[tokio::test]
  async fn test_malformed_push_shows_nothing() {
    let cache = Arc::new(SqliteCacheStorage::in_memory().unwrap());
    let notifier = Arc::new(RecordingNotifier::default());
    let worker = worker_with(cache, full_site(), "v1").with_notifier(notifier.clone());

    assert!(worker.handle_push(Some(b"plain text, not json")).is_none());
    assert!(worker.handle_push(None).is_none());
    assert!(notifier.shown.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_notification_click_resolves_target() {
    let cache = Arc::new(SqliteCacheStorage::in_memory().unwrap());
    let worker = worker_with(cache, full_site(), "v1");
    let notification = Notification {
      title: "t".to_string(),
      body: "b".to_string(),
      icon: None,
      data: Some(serde_json::json!({ "url": "/dashboard/permits" })),
    };

    let target = worker.handle_notification_click(&notification).unwrap();
    assert_eq!(target, url("/dashboard/permits"));
  }
}
