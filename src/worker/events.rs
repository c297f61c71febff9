//! Push notifications and background sync hooks.

use async_trait::async_trait;
use color_eyre::Result;
use serde::{Deserialize, Serialize};

/// Push payload, shown as a system notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub icon: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub data: Option<serde_json::Value>,
}

impl Notification {
  /// Parse a push payload. Anything that is not the expected JSON object
  /// yields `None`.
  pub fn from_payload(payload: &[u8]) -> Option<Self> {
    match serde_json::from_slice(payload) {
      Ok(notification) => Some(notification),
      Err(e) => {
        tracing::warn!(error = %e, "ignoring malformed push payload");
        None
      }
    }
  }

  /// Path or URL the notification should open when clicked.
  pub fn target(&self) -> &str {
    self
      .data
      .as_ref()
      .and_then(|d| d.get("url"))
      .and_then(|u| u.as_str())
      .unwrap_or("/")
  }
}

/// Displays notifications to the user.
pub trait Notifier: Send + Sync {
  fn show(&self, notification: &Notification);
}

/// Notifier that writes to the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
  fn show(&self, notification: &Notification) {
    tracing::info!(
      title = %notification.title,
      body = %notification.body,
      "notification"
    );
  }
}

/// Replays actions queued while offline once connectivity is back.
///
/// Implementations must be idempotent: the platform may fire the same sync
/// event more than once.
#[async_trait]
pub trait SyncReplay: Send + Sync {
  async fn replay(&self) -> Result<()>;
}

/// Nothing is queued yet, so replay has nothing to do.
pub struct NoopReplay;

#[async_trait]
impl SyncReplay for NoopReplay {
  async fn replay(&self) -> Result<()> {
    tracing::debug!("no queued actions to replay");
    Ok(())
  }
}
