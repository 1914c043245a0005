//! Core request, response and cache entry types.

use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

/// Synthetic header carrying the capture time (epoch millis) of a cached response.
pub const CAPTURED_AT_HEADER: &str = "x-tablecache-captured-at";
/// Synthetic header carrying the max-age (millis) of the bucket the response lives in.
pub const MAX_AGE_HEADER: &str = "x-tablecache-max-age";

/// What the requester intends to do with the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Destination {
  /// Top-level page navigation
  Document,
  Image,
  Script,
  Style,
  Font,
  Manifest,
  /// fetch()/XHR style request with no destination
  #[default]
  Empty,
}

/// An intercepted outgoing request.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
  pub destination: Destination,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn get(url: Url, destination: Destination) -> Self {
    Self {
      method: Method::GET,
      url,
      destination,
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn post_json(url: Url, body: Vec<u8>) -> Self {
    Self {
      method: Method::POST,
      url,
      destination: Destination::Empty,
      headers: vec![("content-type".to_string(), "application/json".to_string())],
      body: Some(body),
    }
  }

  pub fn is_navigation(&self) -> bool {
    self.destination == Destination::Document
  }
}

/// A response as seen by the application, whether from network, cache or fallback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  /// Set a header, replacing any existing value (names compare case-insensitively).
  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    self.headers.push((name.to_string(), value.into()));
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

/// A stored request -> response pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  /// Normalised request URL
  pub request_key: String,
  /// Stored response, including the synthetic metadata headers
  pub response: Response,
  pub captured_at: i64,
  pub max_age_ms: i64,
}

impl CacheEntry {
  /// Build an entry stamped at `captured_at`, attaching the metadata headers.
  pub fn stamp(request_key: String, response: Response, captured_at: i64, max_age_ms: i64) -> Self {
    let response = response
      .with_header(CAPTURED_AT_HEADER, captured_at.to_string())
      .with_header(MAX_AGE_HEADER, max_age_ms.to_string());
    Self {
      request_key,
      response,
      captured_at,
      max_age_ms,
    }
  }

  /// Rebuild an entry from a stored response using only its metadata headers.
  pub fn from_stored(request_key: String, response: Response) -> Option<Self> {
    let captured_at = response.header(CAPTURED_AT_HEADER)?.parse().ok()?;
    let max_age_ms = response.header(MAX_AGE_HEADER)?.parse().ok()?;
    Some(Self {
      request_key,
      response,
      captured_at,
      max_age_ms,
    })
  }

  pub fn is_expired(&self, now: i64) -> bool {
    now - self.captured_at > self.max_age_ms
  }
}

/// Result of handling a request, including metadata about where it came from.
#[derive(Debug, Clone)]
pub struct CacheResult {
  /// The actual response
  pub data: Response,
  /// Where the response came from
  pub source: CacheSource,
  /// When the response was cached (if from cache)
  pub cached_at: Option<i64>,
}

impl CacheResult {
  /// Create a new result from fresh network data.
  pub fn from_network(data: Response) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new result from a cache entry.
  pub fn from_cache(entry: CacheEntry, is_stale: bool) -> Self {
    Self {
      data: entry.response,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(entry.captured_at),
    }
  }

  /// Create a result for a synthesised substitute response.
  pub fn fallback(data: Response) -> Self {
    Self {
      data,
      source: CacheSource::Fallback,
      cached_at: None,
    }
  }

  /// Create a result for a write that was parked in the outbox.
  pub fn queued(data: Response) -> Self {
    Self {
      data,
      source: CacheSource::Queued,
      cached_at: None,
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still within max-age
  CacheFresh,
  /// Data from cache past its max-age, served because nothing better was available
  CacheStale,
  /// Synthesised substitute
  Fallback,
  /// Write accepted into the outbox for later delivery
  Queued,
}
