//! Install/activate transitions and the expiration sweep.

use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use rusqlite::{params, OptionalExtension};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheLayer, Destination, NoopStorage, Request, RequestKey, SqliteStorage};
use crate::classify::ResourceClass;
use crate::config::Config;

/// Where the layer is in its startup sequence.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
  /// Registered, nothing installed yet
  #[default]
  Parsed,
  Installing,
  /// Installed and waiting to take over
  Installed,
  Activating,
  /// Controlling clients
  Activated,
}

impl LifecycleState {
  pub fn as_str(&self) -> &'static str {
    match self {
      LifecycleState::Parsed => "parsed",
      LifecycleState::Installing => "installing",
      LifecycleState::Installed => "installed",
      LifecycleState::Activating => "activating",
      LifecycleState::Activated => "activated",
    }
  }

  fn parse(s: &str) -> Result<Self> {
    match s {
      "parsed" => Ok(LifecycleState::Parsed),
      "installing" => Ok(LifecycleState::Installing),
      "installed" => Ok(LifecycleState::Installed),
      "activating" => Ok(LifecycleState::Activating),
      "activated" => Ok(LifecycleState::Activated),
      other => Err(eyre!("Unknown lifecycle state '{}'", other)),
    }
  }
}

/// Lifecycle position of one version, as last persisted.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SavedLifecycle {
  pub state: LifecycleState,
  pub skip_waiting: bool,
}

/// Persistence for the lifecycle position, keyed by version tag.
pub trait LifecycleStore: Send + Sync {
  fn load_lifecycle(&self, version: &str) -> Result<Option<SavedLifecycle>>;
  fn save_lifecycle(&self, version: &str, saved: SavedLifecycle) -> Result<()>;
}

impl LifecycleStore for SqliteStorage {
  fn load_lifecycle(&self, version: &str) -> Result<Option<SavedLifecycle>> {
    let row: Option<(String, bool)> = self
      .lock()?
      .query_row(
        "SELECT state, skip_waiting FROM lifecycle WHERE version = ?",
        params![version],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read lifecycle state: {}", e))?;

    match row {
      Some((state, skip_waiting)) => Ok(Some(SavedLifecycle {
        state: LifecycleState::parse(&state)?,
        skip_waiting,
      })),
      None => Ok(None),
    }
  }

  fn save_lifecycle(&self, version: &str, saved: SavedLifecycle) -> Result<()> {
    self
      .lock()?
      .execute(
        "INSERT INTO lifecycle (version, state, skip_waiting) VALUES (?, ?, ?)
         ON CONFLICT(version) DO UPDATE SET state = excluded.state,
           skip_waiting = excluded.skip_waiting",
        params![version, saved.state.as_str(), saved.skip_waiting],
      )
      .map_err(|e| eyre!("Failed to save lifecycle state: {}", e))?;
    Ok(())
  }
}

impl LifecycleStore for NoopStorage {
  fn load_lifecycle(&self, _version: &str) -> Result<Option<SavedLifecycle>> {
    Ok(None)
  }

  fn save_lifecycle(&self, _version: &str, _saved: SavedLifecycle) -> Result<()> {
    Ok(())
  }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct InstallReport {
  /// Manifest paths now in the static bucket
  pub cached: Vec<String>,
  /// Manifest paths that could not be fetched
  pub failed: Vec<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ActivateReport {
  pub deleted_buckets: Vec<String>,
  pub expired_entries: usize,
}

/// Install/activate state machine for the configured version.
///
/// The state and the skip-waiting flag are persisted on every change, so a
/// later process for the same version picks up where this one left off.
pub struct Lifecycle {
  config: Arc<Config>,
  cache: CacheLayer,
  store: Arc<dyn LifecycleStore>,
  state: Mutex<LifecycleState>,
  skip_waiting: AtomicBool,
}

impl Lifecycle {
  pub fn new(config: Arc<Config>, cache: CacheLayer, store: Arc<dyn LifecycleStore>) -> Self {
    let saved = match store.load_lifecycle(&config.version) {
      Ok(saved) => saved.unwrap_or_default(),
      Err(e) => {
        warn!("Could not restore lifecycle state, starting fresh: {}", e);
        SavedLifecycle::default()
      }
    };
    debug!(state = ?saved.state, skip_waiting = saved.skip_waiting, "Lifecycle restored");

    Self {
      config,
      cache,
      store,
      state: Mutex::new(saved.state),
      skip_waiting: AtomicBool::new(saved.skip_waiting),
    }
  }

  pub fn state(&self) -> LifecycleState {
    *self.state.lock().unwrap_or_else(|e| e.into_inner())
  }

  fn set_state(&self, state: LifecycleState) {
    *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    debug!(?state, "Lifecycle transition");
    self.persist();
  }

  fn persist(&self) {
    let saved = SavedLifecycle {
      state: self.state(),
      skip_waiting: self.is_skipping_waiting(),
    };
    if let Err(e) = self.store.save_lifecycle(&self.config.version, saved) {
      warn!("Failed to persist lifecycle state: {}", e);
    }
  }

  /// Ask an installed layer to activate without waiting.
  pub fn skip_waiting(&self) {
    self.skip_waiting.store(true, Ordering::SeqCst);
    self.persist();
  }

  pub fn is_skipping_waiting(&self) -> bool {
    self.skip_waiting.load(Ordering::SeqCst)
  }

  /// Pre-cache the baseline manifest into the static bucket.
  ///
  /// Individual failures are logged and reported; they never fail the install.
  pub async fn install(&self) -> InstallReport {
    self.set_state(LifecycleState::Installing);

    let class = ResourceClass::Static;
    let bucket = self.config.bucket_name(class);
    let policy = self.config.policy(class);

    let outcomes = join_all(self.config.precache.iter().map(|path| {
      let bucket = bucket.as_str();
      async move {
        let url = self.config.resolve(path)?;
        let destination = if path == "/" {
          Destination::Document
        } else {
          Destination::Empty
        };
        let request = Request::get(url.clone(), destination);
        let response = self.cache.network().fetch(&request).await?;
        if !response.is_success() {
          color_eyre::eyre::bail!("{} answered {}", url, response.status);
        }
        self.cache.store(bucket, &RequestKey::new(&url), &response, policy);
        Ok::<_, color_eyre::Report>(())
      }
    }))
    .await;

    let mut report = InstallReport::default();
    for (path, outcome) in self.config.precache.iter().zip(outcomes) {
      match outcome {
        Ok(()) => report.cached.push(path.clone()),
        Err(e) => {
          warn!(path = path.as_str(), "Pre-cache failed: {}", e);
          report.failed.push(path.clone());
        }
      }
    }

    self.set_state(LifecycleState::Installed);
    info!(
      cached = report.cached.len(),
      failed = report.failed.len(),
      "Installed"
    );
    report
  }

  /// Retire buckets from other versions, take control, then sweep expired entries.
  pub fn activate(&self) -> Result<ActivateReport> {
    self.set_state(LifecycleState::Activating);

    let current = self.config.current_buckets();
    let storage = self.cache.storage();
    let mut report = ActivateReport::default();

    for name in storage.bucket_names()? {
      if current.contains(&name) {
        continue;
      }
      match storage.delete_bucket(&name) {
        Ok(_) => {
          info!(bucket = name.as_str(), "Deleted outdated bucket");
          report.deleted_buckets.push(name);
        }
        Err(e) => warn!(bucket = name.as_str(), "Failed to delete outdated bucket: {}", e),
      }
    }

    self.set_state(LifecycleState::Activated);
    info!(version = self.config.version.as_str(), "Activated and controlling clients");

    report.expired_entries = self.sweep()?;
    Ok(report)
  }

  /// Delete every entry older than its class max-age. Returns the number removed.
  pub fn sweep(&self) -> Result<usize> {
    let now = self.cache.now();
    let storage = self.cache.storage();
    let existing = storage.bucket_names()?;
    let mut removed = 0;

    for class in ResourceClass::ALL {
      let bucket = self.config.bucket_name(class);
      if !existing.contains(&bucket) {
        continue;
      }
      let max_age = self.config.policy(class).max_age_ms;

      for entry in storage.entries(&bucket)? {
        if now - entry.captured_at <= max_age {
          continue;
        }
        let Ok(url) = Url::parse(&entry.request_key) else {
          continue;
        };
        match storage.delete_entry(&bucket, &RequestKey::new(&url)) {
          Ok(true) => removed += 1,
          Ok(false) => {}
          Err(e) => warn!(bucket = bucket.as_str(), "Failed to delete expired entry: {}", e),
        }
      }
    }

    if removed > 0 {
      info!(removed, "Swept expired entries");
    }
    Ok(removed)
  }
}
