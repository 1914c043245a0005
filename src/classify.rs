//! Resource classification of intercepted requests.

use reqwest::Method;
use tracing::debug;
use url::Url;

use crate::cache::{Destination, Request};
use crate::config::{ClassifierConfig, Config};

/// Category of requests sharing one caching policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
  Static,
  Image,
  Api,
  Page,
  Other,
}

impl ResourceClass {
  pub const ALL: [ResourceClass; 5] = [
    ResourceClass::Static,
    ResourceClass::Image,
    ResourceClass::Api,
    ResourceClass::Page,
    ResourceClass::Other,
  ];

  pub fn as_str(&self) -> &'static str {
    match self {
      ResourceClass::Static => "static",
      ResourceClass::Image => "image",
      ResourceClass::Api => "api",
      ResourceClass::Page => "page",
      ResourceClass::Other => "other",
    }
  }
}

/// Assigns requests to resource classes.
///
/// Rules run in a fixed order: static, image, API, page, other. A request that
/// looks both static and API-like is static, even when it is cross-origin.
#[derive(Debug, Clone)]
pub struct Classifier {
  origin: Url,
  rules: ClassifierConfig,
}

impl Classifier {
  pub fn new(config: &Config) -> Self {
    Self {
      origin: config.origin.clone(),
      rules: config.classifier.clone(),
    }
  }

  /// Classify a request for caching. Only `GET` requests are cacheable; everything
  /// else returns `None` and bypasses the cache.
  pub fn classify(&self, request: &Request) -> Option<ResourceClass> {
    if request.method != Method::GET {
      return None;
    }

    let class = self.classify_url(&request.url, request.destination);
    debug!(url = %request.url, class = class.as_str(), "Classified request");
    Some(class)
  }

  fn classify_url(&self, url: &Url, destination: Destination) -> ResourceClass {
    let path = url.path();
    let extension = extension(path);
    let has_extension = |list: &[String]| {
      extension
        .as_deref()
        .map(|ext| list.iter().any(|candidate| candidate.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
    };

    let static_destination = matches!(
      destination,
      Destination::Script | Destination::Style | Destination::Font | Destination::Manifest
    );
    if static_destination
      || has_extension(&self.rules.static_extensions)
      || self.rules.static_assets.iter().any(|asset| asset == path)
    {
      return ResourceClass::Static;
    }

    if destination == Destination::Image
      || has_extension(&self.rules.image_extensions)
      || self.is_image_host(url)
    {
      return ResourceClass::Image;
    }

    let same_origin = url.origin() == self.origin.origin();
    if !same_origin
      || self
        .rules
        .api_prefixes
        .iter()
        .any(|prefix| path.starts_with(prefix.as_str()))
    {
      return ResourceClass::Api;
    }

    if destination == Destination::Document || extension.is_none() {
      return ResourceClass::Page;
    }

    ResourceClass::Other
  }

  fn is_image_host(&self, url: &Url) -> bool {
    let Some(host) = url.host_str() else {
      return false;
    };
    self.rules.image_hosts.iter().any(|candidate| {
      host == candidate
        || host
          .strip_suffix(candidate.as_str())
          .is_some_and(|rest| rest.ends_with('.'))
    })
  }
}

/// Lowercased file extension of the last path segment, if any.
fn extension(path: &str) -> Option<String> {
  let segment = path.rsplit('/').next().unwrap_or("");
  let (stem, ext) = segment.rsplit_once('.')?;
  if stem.is_empty() || ext.is_empty() {
    return None;
  }
  Some(ext.to_ascii_lowercase())
}
