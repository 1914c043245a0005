use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

use crate::classify::ResourceClass;

const MINUTE_MS: i64 = 60 * 1000;
const DAY_MS: i64 = 24 * 60 * MINUTE_MS;

/// Interception layer configuration.
///
/// Built once at startup and shared read-only with every component.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin of the ordering application; same-origin requests are pages or API calls
  pub origin: Url,
  /// Build version embedded in every bucket name
  pub version: String,
  /// Baseline asset manifest pre-cached at install
  pub precache: Vec<String>,
  /// Document served to navigations when neither network nor cache answer
  pub offline_page: String,
  /// Background sync tag that drains the outbox
  pub sync_tag: String,
  /// Path that receives order submissions
  pub orders_endpoint: String,
  pub outbox: OutboxConfig,
  pub classifier: ClassifierConfig,
  pub policies: PoliciesConfig,
}

/// Caching strategy applied to a resource class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
  NetworkOnly,
  CacheOnly,
}

/// Static per-class caching policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Policy {
  pub strategy: Strategy,
  pub max_age_ms: i64,
  pub max_entries: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoliciesConfig {
  #[serde(rename = "static")]
  pub static_assets: Policy,
  pub image: Policy,
  pub api: Policy,
  pub page: Policy,
  /// Falls back to the API policy when unset
  pub other: Option<Policy>,
}

impl Default for PoliciesConfig {
  fn default() -> Self {
    Self {
      static_assets: Policy {
        strategy: Strategy::CacheFirst,
        max_age_ms: 30 * DAY_MS,
        max_entries: 100,
      },
      image: Policy {
        strategy: Strategy::CacheFirst,
        max_age_ms: 7 * DAY_MS,
        max_entries: 60,
      },
      api: Policy {
        strategy: Strategy::NetworkFirst,
        max_age_ms: 5 * MINUTE_MS,
        max_entries: 50,
      },
      page: Policy {
        strategy: Strategy::StaleWhileRevalidate,
        max_age_ms: DAY_MS,
        max_entries: 30,
      },
      other: None,
    }
  }
}

/// Pattern tables used by the resource classifier.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
  /// File extensions (without dot) of build assets
  pub static_extensions: Vec<String>,
  /// Fixed asset paths that are always static
  pub static_assets: Vec<String>,
  pub image_extensions: Vec<String>,
  /// Image hosting domains (suffix match)
  pub image_hosts: Vec<String>,
  pub api_prefixes: Vec<String>,
}

impl Default for ClassifierConfig {
  fn default() -> Self {
    Self {
      static_extensions: to_strings(&["js", "mjs", "css", "woff", "woff2", "ttf", "json", "map"]),
      static_assets: to_strings(&["/manifest.json", "/favicon.ico", "/icon-192.png", "/icon-512.png"]),
      image_extensions: to_strings(&["png", "jpg", "jpeg", "gif", "webp", "avif", "svg", "ico"]),
      image_hosts: to_strings(&["images.unsplash.com", "res.cloudinary.com", "imgix.net"]),
      api_prefixes: to_strings(&["/api/"]),
    }
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
  /// Attempts after which a record is parked as failed. Unset retries forever.
  pub max_attempts: Option<u32>,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      origin: Url::parse("http://localhost:3000/").expect("static origin parses"),
      version: "v1".to_string(),
      precache: to_strings(&["/", "/manifest.json", "/icon-192.png", "/offline.html"]),
      offline_page: "/offline.html".to_string(),
      sync_tag: "orders-sync".to_string(),
      orders_endpoint: "/api/orders".to_string(),
      outbox: OutboxConfig::default(),
      classifier: ClassifierConfig::default(),
      policies: PoliciesConfig::default(),
    }
  }
}

fn to_strings(items: &[&str]) -> Vec<String> {
  items.iter().map(|s| s.to_string()).collect()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./tablecache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/tablecache/config.yaml
  ///
  /// Built-in defaults apply when no file is found.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => {
        tracing::info!("No configuration file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("tablecache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("tablecache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  /// Parse configuration from YAML text. An empty document yields the defaults.
  pub fn from_yaml(contents: &str) -> Result<Self> {
    if contents.trim().is_empty() {
      return Ok(Self::default());
    }
    let config: Config = serde_yaml::from_str(contents)?;
    if config.version.is_empty() {
      return Err(eyre!("version must not be empty"));
    }
    Ok(config)
  }

  /// Policy governing a resource class.
  pub fn policy(&self, class: ResourceClass) -> Policy {
    match class {
      ResourceClass::Static => self.policies.static_assets,
      ResourceClass::Image => self.policies.image,
      ResourceClass::Api => self.policies.api,
      ResourceClass::Page => self.policies.page,
      ResourceClass::Other => self.policies.other.unwrap_or(self.policies.api),
    }
  }

  /// Versioned bucket name for a resource class, e.g. `static-v3`.
  pub fn bucket_name(&self, class: ResourceClass) -> String {
    format!("{}-{}", class.as_str(), self.version)
  }

  /// Names of every bucket belonging to the active version.
  pub fn current_buckets(&self) -> Vec<String> {
    ResourceClass::ALL
      .iter()
      .map(|class| self.bucket_name(*class))
      .collect()
  }

  /// Resolve an application path against the configured origin.
  pub fn resolve(&self, path: &str) -> Result<Url> {
    self
      .origin
      .join(path)
      .map_err(|e| eyre!("Invalid path {}: {}", path, e))
  }

  /// Default database path.
  pub fn default_db_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("tablecache").join("cache.db"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_empty_document_uses_defaults() {
    let config = Config::from_yaml("").unwrap();
    assert_eq!(config.version, "v1");
    assert_eq!(config.sync_tag, "orders-sync");
    assert_eq!(config.precache.len(), 4);
  }

  #[test]
  fn test_partial_override() {
    let yaml = r#"
origin: https://bistro.example/
version: v7
policies:
  api:
    strategy: network-only
    max_age_ms: 1000
    max_entries: 5
outbox:
  max_attempts: 3
"#;
    let config = Config::from_yaml(yaml).unwrap();
    assert_eq!(config.origin.as_str(), "https://bistro.example/");
    assert_eq!(config.policy(ResourceClass::Api).strategy, Strategy::NetworkOnly);
    // untouched policies keep their defaults
    assert_eq!(config.policy(ResourceClass::Static).strategy, Strategy::CacheFirst);
    assert_eq!(config.outbox.max_attempts, Some(3));
  }

  #[test]
  fn test_other_falls_back_to_api_policy() {
    let config = Config::default();
    assert_eq!(
      config.policy(ResourceClass::Other),
      config.policy(ResourceClass::Api)
    );
  }

  #[test]
  fn test_bucket_names_carry_version() {
    let config = Config::from_yaml("version: v2").unwrap();
    assert_eq!(config.bucket_name(ResourceClass::Static), "static-v2");
    assert_eq!(config.bucket_name(ResourceClass::Image), "image-v2");
    assert!(config.current_buckets().iter().all(|b| b.ends_with("-v2")));
  }

  #[test]
  fn test_empty_version_rejected() {
    assert!(Config::from_yaml("version: ''").is_err());
  }
}
