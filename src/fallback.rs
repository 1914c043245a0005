//! Substitute responses for requests neither network nor cache can answer.

use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{CacheStorage, Destination, Request, RequestKey, Response};
use crate::classify::ResourceClass;
use crate::config::Config;

/// Marks a synthesised response and says which kind it is.
pub const FALLBACK_HEADER: &str = "x-tablecache-fallback";

const PLACEHOLDER_SVG: &str = concat!(
  r##"<svg xmlns="http://www.w3.org/2000/svg" width="400" height="300" viewBox="0 0 400 300">"##,
  r##"<rect width="400" height="300" fill="#e5e7eb"/>"##,
  r##"<text x="200" y="150" font-family="sans-serif" font-size="18" fill="#6b7280" "##,
  r##"text-anchor="middle" dominant-baseline="middle">Image unavailable offline</text>"##,
  "</svg>"
);

const OFFLINE_TEXT: &str = "You are offline and this page has not been saved yet.";

/// Builds deterministic substitute responses. Never fails.
pub struct Fallback {
  storage: Arc<dyn CacheStorage>,
  offline_bucket: String,
  offline_key: Option<RequestKey>,
}

impl Fallback {
  pub fn new(config: &Config, storage: Arc<dyn CacheStorage>) -> Self {
    let offline_key = match config.resolve(&config.offline_page) {
      Ok(url) => Some(RequestKey::new(&url)),
      Err(e) => {
        warn!("Offline page unusable: {}", e);
        None
      }
    };

    Self {
      storage,
      offline_bucket: config.bucket_name(ResourceClass::Static),
      offline_key,
    }
  }

  /// Substitute for a failed request.
  ///
  /// Navigations get the pre-cached offline document (or a plain-text notice),
  /// images get a placeholder graphic, everything else a 503.
  pub fn respond(&self, request: &Request, class: Option<ResourceClass>) -> Response {
    if request.is_navigation() {
      if let Some(page) = self.offline_page() {
        debug!(url = %request.url, "Serving offline document");
        return page.with_header(FALLBACK_HEADER, "offline-page");
      }
      return Response::new(503, OFFLINE_TEXT)
        .with_header("content-type", "text/plain; charset=utf-8")
        .with_header(FALLBACK_HEADER, "offline-text");
    }

    if request.destination == Destination::Image || class == Some(ResourceClass::Image) {
      return Response::new(200, PLACEHOLDER_SVG)
        .with_header("content-type", "image/svg+xml")
        .with_header("cache-control", "no-store")
        .with_header(FALLBACK_HEADER, "placeholder");
    }

    let body = serde_json::json!({
      "error": "offline",
      "message": "Service unavailable while offline",
    });
    Response::new(503, body.to_string())
      .with_header("content-type", "application/json")
      .with_header(FALLBACK_HEADER, "unavailable")
  }

  fn offline_page(&self) -> Option<Response> {
    let key = self.offline_key.as_ref()?;
    match self.storage.read(&self.offline_bucket, key) {
      Ok(entry) => entry.map(|e| e.response),
      Err(e) => {
        warn!("Offline document unreadable: {}", e);
        None
      }
    }
  }
}
