//! Out-of-band signals: push notifications and foreground messages.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

const DEFAULT_TITLE: &str = "Order update";
const DEFAULT_BODY: &str = "There is news about your order.";
const DEFAULT_ICON: &str = "/icon-192.png";

/// A user-visible notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  /// Page to open when the notification is clicked
  pub url: Option<String>,
  /// Notifications sharing a tag replace each other
  pub tag: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct PushPayload {
  title: Option<String>,
  body: Option<String>,
  icon: Option<String>,
  url: Option<String>,
  tag: Option<String>,
}

impl Notification {
  /// Build a notification from a push payload.
  ///
  /// JSON payloads may set any field; anything else is shown as the body text.
  pub fn from_push(payload: &[u8]) -> Self {
    let parsed = match serde_json::from_slice::<PushPayload>(payload) {
      Ok(parsed) => parsed,
      Err(_) => {
        let text = String::from_utf8_lossy(payload).trim().to_string();
        PushPayload {
          body: (!text.is_empty()).then_some(text),
          ..Default::default()
        }
      }
    };

    Self {
      title: parsed.title.unwrap_or_else(|| DEFAULT_TITLE.to_string()),
      body: parsed.body.unwrap_or_else(|| DEFAULT_BODY.to_string()),
      icon: parsed.icon.unwrap_or_else(|| DEFAULT_ICON.to_string()),
      url: parsed.url,
      tag: parsed.tag,
    }
  }
}

/// Message protocol spoken by the foreground application.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
  PerformanceMetrics {
    #[serde(default)]
    metrics: Value,
  },
  /// Activate an installed layer immediately
  SkipWaiting,
  /// Drop every bucket of the active version
  ClearCache,
  /// Log bucket occupancy
  CacheStatus,
}

impl Message {
  pub fn parse(raw: &str) -> Result<Self> {
    serde_json::from_str(raw).map_err(|e| eyre!("Unrecognised message {}: {}", raw, e))
  }
}

/// Displays notifications to the user.
pub trait Notifier: Send + Sync {
  fn show(&self, notification: &Notification) -> Result<()>;
}

/// Notifier that writes notifications to the log.
pub struct LogNotifier;

impl Notifier for LogNotifier {
  fn show(&self, notification: &Notification) -> Result<()> {
    info!(
      title = notification.title.as_str(),
      body = notification.body.as_str(),
      tag = notification.tag.as_deref(),
      "Notification"
    );
    Ok(())
  }
}

/// Turns push payloads and telemetry messages into notifications and log records.
pub struct Bridge {
  notifier: Arc<dyn Notifier>,
  origin: Url,
}

impl Bridge {
  pub fn new(notifier: Arc<dyn Notifier>, origin: Url) -> Self {
    Self { notifier, origin }
  }

  /// Show the notification carried by a push payload.
  pub fn push(&self, payload: &[u8]) -> Result<Notification> {
    let notification = Notification::from_push(payload);
    self.notifier.show(&notification)?;
    Ok(notification)
  }

  /// Forward performance metrics. Fire-and-forget.
  pub fn forward_metrics(&self, metrics: &Value) {
    info!(target: "telemetry", %metrics, "Performance metrics");
  }

  /// Page to open for a clicked notification. Falls back to the root document.
  pub fn click_target(&self, notification: &Notification) -> Url {
    let Some(url) = notification.url.as_deref() else {
      return self.origin.clone();
    };
    match self.origin.join(url) {
      Ok(target) => target,
      Err(e) => {
        warn!(url, "Ignoring invalid notification link: {}", e);
        self.origin.clone()
      }
    }
  }
}
