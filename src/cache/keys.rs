//! Cache key derivation for intercepted requests.

use sha2::{Digest, Sha256};
use url::Url;

/// Key identifying a cached request within a bucket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestKey {
  url: String,
}

impl RequestKey {
  /// Normalise a URL into a key. Fragments never reach the server, so they are dropped.
  pub fn new(url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self { url: url.into() }
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  /// SHA256 hash for stable, fixed-length storage keys.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}
