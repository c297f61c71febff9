//! Connectivity tracking and the sync hook.
//!
//! The portal pushes local changes when it comes back online. The remote
//! side of that push is pluggable; the controller only tracks status and
//! stamps the store after a successful run.

use async_trait::async_trait;
use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use url::Url;

use super::LocalStore;
use crate::fetch::NetworkFetcher;
use crate::http::Request;
use crate::worker::SyncReplay;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
  Idle,
  Syncing,
  Error,
}

impl SyncStatus {
  pub fn as_str(self) -> &'static str {
    match self {
      SyncStatus::Idle => "idle",
      SyncStatus::Syncing => "syncing",
      SyncStatus::Error => "error",
    }
  }
}

/// Owns the online flag. Only the monitor can change it; everyone else gets
/// a read-only [`ConnectivityHandle`].
pub struct ConnectivityMonitor {
  online: watch::Sender<bool>,
}

impl ConnectivityMonitor {
  pub fn new(initially_online: bool) -> Self {
    let (online, _) = watch::channel(initially_online);
    Self { online }
  }

  /// Change the flag. Watchers wake only on an actual transition.
  pub fn set_online(&self, online: bool) {
    let changed = self.online.send_if_modified(|current| {
      let changed = *current != online;
      *current = online;
      changed
    });
    if changed {
      tracing::info!(online, "connectivity changed");
    }
  }

  pub fn handle(&self) -> ConnectivityHandle {
    ConnectivityHandle {
      online: self.online.subscribe(),
    }
  }

  /// Fetch `probe_url` once and record whether the origin answered. Any
  /// HTTP status counts as online.
  pub async fn probe<F: NetworkFetcher>(&self, network: &F, probe_url: &Url) -> bool {
    let online = match network.fetch(&Request::get(probe_url.clone())).await {
      Ok(_) => true,
      Err(e) => {
        tracing::debug!(error = %e, "connectivity probe failed");
        false
      }
    };
    self.set_online(online);
    online
  }

  /// Probe on a fixed interval until the task is aborted.
  pub fn spawn_probe<F: NetworkFetcher>(
    self: Arc<Self>,
    network: Arc<F>,
    probe_url: Url,
    every: Duration,
  ) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(every);
      loop {
        ticker.tick().await;
        self.probe(network.as_ref(), &probe_url).await;
      }
    })
  }
}

#[derive(Clone)]
pub struct ConnectivityHandle {
  online: watch::Receiver<bool>,
}

impl ConnectivityHandle {
  pub fn is_online(&self) -> bool {
    *self.online.borrow()
  }

  /// Wait for the next transition and return the new state.
  pub async fn changed(&mut self) -> Result<bool> {
    self
      .online
      .changed()
      .await
      .map_err(|e| eyre!("Connectivity monitor dropped: {}", e))?;
    Ok(*self.online.borrow_and_update())
  }
}

/// The remote half of a sync. Receives the store to read pending changes
/// from.
#[async_trait]
pub trait RemoteSync: Send + Sync + 'static {
  async fn push(&self, store: &LocalStore) -> Result<()>;
}

/// Used when no remote endpoint is configured: every sync succeeds
/// without moving data.
pub struct NoopRemote;

#[async_trait]
impl RemoteSync for NoopRemote {
  async fn push(&self, _store: &LocalStore) -> Result<()> {
    tracing::debug!("no remote configured, nothing to push");
    Ok(())
  }
}

pub struct SyncController<R: RemoteSync> {
  store: Arc<LocalStore>,
  remote: R,
  connectivity: ConnectivityHandle,
  status: watch::Sender<SyncStatus>,
}

impl<R: RemoteSync> SyncController<R> {
  pub fn new(store: Arc<LocalStore>, remote: R, connectivity: ConnectivityHandle) -> Self {
    let (status, _) = watch::channel(SyncStatus::Idle);
    Self {
      store,
      remote,
      connectivity,
      status,
    }
  }

  pub fn status(&self) -> SyncStatus {
    *self.status.borrow()
  }

  pub fn subscribe(&self) -> watch::Receiver<SyncStatus> {
    self.status.subscribe()
  }

  /// Run one sync. Offline this is a no-op that leaves the status alone.
  /// A failed push is reported through the status, not the result; only a
  /// failure to record the sync in the store is an error.
  pub async fn sync_data(&self) -> Result<SyncStatus> {
    if !self.connectivity.is_online() {
      tracing::debug!("offline, skipping sync");
      return Ok(self.status());
    }

    self.status.send_replace(SyncStatus::Syncing);

    if let Err(e) = self.remote.push(&self.store).await {
      tracing::warn!(error = %e, "sync failed");
      self.status.send_replace(SyncStatus::Error);
      return Ok(SyncStatus::Error);
    }

    if let Err(e) = self.store.record_sync(Utc::now()) {
      self.status.send_replace(SyncStatus::Error);
      return Err(e);
    }

    tracing::info!("sync complete");
    self.status.send_replace(SyncStatus::Idle);
    Ok(SyncStatus::Idle)
  }

  /// Sync every time connectivity comes back. Ends when the monitor is
  /// dropped.
  pub fn spawn_on_reconnect(self: Arc<Self>) -> JoinHandle<()> {
    tokio::spawn(async move {
      let mut connectivity = self.connectivity.clone();
      while let Ok(online) = connectivity.changed().await {
        if !online {
          continue;
        }
        if let Err(e) = self.sync_data().await {
          tracing::warn!(error = %e, "sync on reconnect failed");
        }
      }
    })
  }
}

/// A background sync event pushes the local store.
#[async_trait]
impl<R: RemoteSync> SyncReplay for SyncController<R> {
  async fn replay(&self) -> Result<()> {
    match self.sync_data().await? {
      SyncStatus::Error => Err(eyre!("Sync finished with errors")),
      _ => Ok(()),
    }
  }
}
