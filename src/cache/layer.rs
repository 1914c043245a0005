//! Strategy engine combining cache storage with network fetching.

use color_eyre::{eyre::eyre, Result};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::keys::RequestKey;
use super::storage::CacheStorage;
use super::traits::{CacheEntry, CacheResult, Request, Response};
use crate::classify::ResourceClass;
use crate::clock::Clock;
use crate::config::{Policy, Strategy};
use crate::fallback::Fallback;
use crate::network::Network;

/// Cache layer that runs caching strategies against storage and the network.
///
/// Concurrent lookups for the same key are not serialised: two cache-first misses
/// both fetch and both write, and the last write wins.
pub struct CacheLayer {
  storage: Arc<dyn CacheStorage>,
  network: Arc<dyn Network>,
  clock: Arc<dyn Clock>,
  fallback: Arc<Fallback>,
  /// Bucket filled at install, consulted when a class bucket misses
  precache_bucket: Option<String>,
  /// Revalidations still running after their request was answered
  background: Arc<Mutex<Vec<JoinHandle<Option<Response>>>>>,
}

impl CacheLayer {
  pub fn new(
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
    clock: Arc<dyn Clock>,
    fallback: Fallback,
  ) -> Self {
    Self {
      storage,
      network,
      clock,
      fallback: Arc::new(fallback),
      precache_bucket: None,
      background: Arc::new(Mutex::new(Vec::new())),
    }
  }

  /// Serve install-time entries from `bucket` when a class bucket has no copy.
  pub fn with_precache_bucket(mut self, bucket: impl Into<String>) -> Self {
    self.precache_bucket = Some(bucket.into());
    self
  }

  pub fn storage(&self) -> &Arc<dyn CacheStorage> {
    &self.storage
  }

  pub fn network(&self) -> &Arc<dyn Network> {
    &self.network
  }

  pub fn now(&self) -> i64 {
    self.clock.now_millis()
  }

  /// Answer a classified GET request according to its policy.
  ///
  /// Network-only failures and cache-only misses are returned as errors; every
  /// other strategy ends in a response, substituting the fallback if needed.
  pub async fn respond(
    &self,
    request: &Request,
    class: ResourceClass,
    bucket: &str,
    policy: Policy,
  ) -> Result<CacheResult> {
    let key = RequestKey::new(&request.url);

    let result = match policy.strategy {
      Strategy::CacheFirst => self.cache_first(request, class, bucket, &key, policy).await,
      Strategy::NetworkFirst => self.network_first(request, class, bucket, &key, policy).await,
      Strategy::StaleWhileRevalidate => {
        self
          .stale_while_revalidate(request, class, bucket, &key, policy)
          .await
      }
      Strategy::NetworkOnly => return self.network_only(request).await,
      Strategy::CacheOnly => return self.cache_only(request, bucket, &key),
    };

    debug!(url = %request.url, bucket, source = ?result.source, "Request answered");
    Ok(result)
  }

  /// 1. Check cache - if fresh, return immediately
  /// 2. If expired/missing, fetch from network and store the response
  /// 3. On network failure, return the fallback
  async fn cache_first(
    &self,
    request: &Request,
    class: ResourceClass,
    bucket: &str,
    key: &RequestKey,
    policy: Policy,
  ) -> CacheResult {
    if let Some(entry) = self.lookup(bucket, key) {
      if !entry.is_expired(self.now()) {
        return CacheResult::from_cache(entry, false);
      }
      debug!(url = key.url(), bucket, "Cached entry expired, refetching");
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        self.store(bucket, key, &response, policy);
        CacheResult::from_network(response)
      }
      Err(e) => {
        warn!(url = key.url(), "Network unavailable: {}", e);
        CacheResult::fallback(self.fallback.respond(request, Some(class)))
      }
    }
  }

  /// 1. Fetch from network and store the response
  /// 2. On network failure, serve whatever the cache holds regardless of age
  /// 3. Otherwise return the fallback
  async fn network_first(
    &self,
    request: &Request,
    class: ResourceClass,
    bucket: &str,
    key: &RequestKey,
    policy: Policy,
  ) -> CacheResult {
    match self.network.fetch(request).await {
      Ok(response) => {
        self.store(bucket, key, &response, policy);
        CacheResult::from_network(response)
      }
      Err(e) => {
        warn!(url = key.url(), "Network unavailable, trying cache: {}", e);
        match self.lookup(bucket, key) {
          Some(entry) => {
            let stale = entry.is_expired(self.now());
            CacheResult::from_cache(entry, stale)
          }
          None => CacheResult::fallback(self.fallback.respond(request, Some(class))),
        }
      }
    }
  }

  /// Serve the cached entry at any age while a detached fetch refreshes it.
  /// Without a cached entry the fetch is awaited instead.
  async fn stale_while_revalidate(
    &self,
    request: &Request,
    class: ResourceClass,
    bucket: &str,
    key: &RequestKey,
    policy: Policy,
  ) -> CacheResult {
    let revalidation = {
      let layer = self.clone();
      let request = request.clone();
      let bucket = bucket.to_string();
      let key = key.clone();
      tokio::spawn(async move { layer.revalidate(&request, &bucket, &key, policy).await })
    };

    if let Some(entry) = self.lookup(bucket, key) {
      self.track(revalidation);
      let stale = entry.is_expired(self.now());
      return CacheResult::from_cache(entry, stale);
    }

    match revalidation.await {
      Ok(Some(response)) => CacheResult::from_network(response),
      Ok(None) => CacheResult::fallback(self.fallback.respond(request, Some(class))),
      Err(e) => {
        warn!(url = key.url(), "Revalidation task failed: {}", e);
        CacheResult::fallback(self.fallback.respond(request, Some(class)))
      }
    }
  }

  /// Background half of stale-while-revalidate. Failures are logged, never raised.
  async fn revalidate(
    &self,
    request: &Request,
    bucket: &str,
    key: &RequestKey,
    policy: Policy,
  ) -> Option<Response> {
    match self.network.fetch(request).await {
      Ok(response) => {
        self.store(bucket, key, &response, policy);
        Some(response)
      }
      Err(e) => {
        debug!(url = key.url(), "Revalidation failed: {}", e);
        None
      }
    }
  }

  async fn network_only(&self, request: &Request) -> Result<CacheResult> {
    self
      .network
      .fetch(request)
      .await
      .map(CacheResult::from_network)
  }

  fn cache_only(&self, request: &Request, bucket: &str, key: &RequestKey) -> Result<CacheResult> {
    match self.lookup(bucket, key) {
      Some(entry) => {
        let stale = entry.is_expired(self.now());
        Ok(CacheResult::from_cache(entry, stale))
      }
      None => Err(eyre!("No cached response for {}", request.url)),
    }
  }

  fn track(&self, handle: JoinHandle<Option<Response>>) {
    let mut background = self.background.lock().unwrap_or_else(|e| e.into_inner());
    background.retain(|handle| !handle.is_finished());
    background.push(handle);
  }

  /// Wait until every background revalidation has written its result.
  pub async fn settle(&self) {
    loop {
      let pending = std::mem::take(&mut *self.background.lock().unwrap_or_else(|e| e.into_inner()));
      if pending.is_empty() {
        return;
      }
      debug!(count = pending.len(), "Waiting for background revalidations");
      for handle in pending {
        if let Err(e) = handle.await {
          warn!("Revalidation task failed: {}", e);
        }
      }
    }
  }

  /// Read an entry without applying expiration, falling back to the precache
  /// bucket on a miss. Store failures degrade to a miss.
  pub fn lookup(&self, bucket: &str, key: &RequestKey) -> Option<CacheEntry> {
    if let Some(entry) = self.read(bucket, key) {
      return Some(entry);
    }
    match self.precache_bucket.as_deref() {
      Some(precache) if precache != bucket => {
        let entry = self.read(precache, key)?;
        debug!(url = key.url(), bucket = precache, "Served from precache");
        Some(entry)
      }
      _ => None,
    }
  }

  fn read(&self, bucket: &str, key: &RequestKey) -> Option<CacheEntry> {
    match self.storage.read(bucket, key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(url = key.url(), bucket, "Cache read failed, treating as miss: {}", e);
        None
      }
    }
  }

  /// Write a successful response into a bucket, stamped with the current time.
  /// Error statuses are never cached; store failures are logged and ignored.
  pub fn store(&self, bucket: &str, key: &RequestKey, response: &Response, policy: Policy) {
    if !response.is_success() {
      debug!(url = key.url(), status = response.status, "Not caching unsuccessful response");
      return;
    }

    let entry = CacheEntry::stamp(
      key.url().to_string(),
      response.clone(),
      self.now(),
      policy.max_age_ms,
    );
    if let Err(e) = self.storage.write(bucket, key, &entry, policy.max_entries) {
      warn!(url = key.url(), bucket, "Cache write failed: {}", e);
    }
  }
}

impl Clone for CacheLayer {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      network: Arc::clone(&self.network),
      clock: Arc::clone(&self.clock),
      fallback: Arc::clone(&self.fallback),
      precache_bucket: self.precache_bucket.clone(),
      background: Arc::clone(&self.background),
    }
  }
}
