//! The interception layer: explicit handlers for every platform event.

use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{
  CacheLayer, CacheResult, CacheStorage, NoopStorage, Request, Response, SqliteStorage,
};
use crate::classify::{Classifier, ResourceClass};
use crate::clock::Clock;
use crate::config::Config;
use crate::fallback::Fallback;
use crate::lifecycle::{ActivateReport, InstallReport, Lifecycle, LifecycleState};
use crate::network::Network;
use crate::notify::{Bridge, Message, Notification, Notifier};
use crate::lifecycle::LifecycleStore;
use crate::outbox::{self, DrainReport, Outbox, OutboxRecord, OutboxStatus, OutboxStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketStatus {
  pub name: String,
  pub entries: usize,
}

#[derive(Debug, Clone)]
pub struct LayerStatus {
  pub state: LifecycleState,
  pub passthrough: bool,
  pub buckets: Vec<BucketStatus>,
  pub orders: Vec<OutboxRecord>,
}

impl LayerStatus {
  pub fn orders_with(&self, status: OutboxStatus) -> usize {
    self.orders.iter().filter(|r| r.status == status).count()
  }
}

/// Request interception, caching and offline queueing for one platform instance.
///
/// Cheap to clone; every clone shares the same stores.
#[derive(Clone)]
pub struct Worker {
  config: Arc<Config>,
  classifier: Arc<Classifier>,
  cache: CacheLayer,
  lifecycle: Arc<Lifecycle>,
  outbox: Arc<Outbox>,
  bridge: Arc<Bridge>,
  passthrough: bool,
}

impl Worker {
  pub fn new<S>(
    config: Arc<Config>,
    storage: Arc<S>,
    network: Arc<dyn Network>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
  ) -> Result<Self>
  where
    S: CacheStorage + OutboxStore + LifecycleStore + 'static,
  {
    let cache_storage: Arc<dyn CacheStorage> = storage.clone();
    let outbox_store: Arc<dyn OutboxStore> = storage.clone();
    let lifecycle_store: Arc<dyn LifecycleStore> = storage;

    let fallback = Fallback::new(&config, cache_storage.clone());
    let cache = CacheLayer::new(cache_storage, network.clone(), clock.clone(), fallback)
      .with_precache_bucket(config.bucket_name(ResourceClass::Static));
    let endpoint = config.resolve(&config.orders_endpoint)?;
    let outbox = Outbox::new(
      outbox_store,
      network,
      clock,
      endpoint,
      config.outbox.max_attempts,
    );

    Ok(Self {
      classifier: Arc::new(Classifier::new(&config)),
      lifecycle: Arc::new(Lifecycle::new(config.clone(), cache.clone(), lifecycle_store)),
      bridge: Arc::new(Bridge::new(notifier, config.origin.clone())),
      outbox: Arc::new(outbox),
      cache,
      config,
      passthrough: false,
    })
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn is_passthrough(&self) -> bool {
    self.passthrough
  }

  /// Handle an intercepted request.
  ///
  /// GET requests run their class strategy. Other methods go to the network; a
  /// failed order submission is parked in the outbox and answered with 202.
  pub async fn handle_fetch(&self, request: Request) -> Result<CacheResult> {
    if self.passthrough {
      return self
        .cache
        .network()
        .fetch(&request)
        .await
        .map(CacheResult::from_network);
    }

    match self.classifier.classify(&request) {
      Some(class) => {
        let bucket = self.config.bucket_name(class);
        let policy = self.config.policy(class);
        self.cache.respond(&request, class, &bucket, policy).await
      }
      None => self.forward_write(request).await,
    }
  }

  async fn forward_write(&self, request: Request) -> Result<CacheResult> {
    let outcome = self.cache.network().fetch(&request).await;
    if !self.is_order_submission(&request) {
      return outcome.map(CacheResult::from_network);
    }

    let reason = match &outcome {
      Ok(response) if !outbox::is_undeliverable(response.status) => None,
      Ok(response) => Some(format!("order endpoint answered {}", response.status)),
      Err(e) => Some(e.to_string()),
    };
    let Some(reason) = reason else {
      return outcome.map(CacheResult::from_network);
    };

    warn!(url = %request.url, "Order submission failed, queueing: {}", reason);
    let payload = request
      .body
      .as_deref()
      .map(|body| {
        serde_json::from_slice(body)
          .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
      })
      .unwrap_or(Value::Null);

    match self.outbox.enqueue(payload) {
      Ok(id) => {
        let body = serde_json::json!({ "queued": true, "id": id });
        Ok(CacheResult::queued(
          Response::new(202, body.to_string()).with_header("content-type", "application/json"),
        ))
      }
      Err(e) => {
        warn!("Could not queue order: {}", e);
        outcome.map(CacheResult::from_network)
      }
    }
  }

  fn is_order_submission(&self, request: &Request) -> bool {
    let endpoint = self.outbox.endpoint();
    matches!(request.method, Method::POST | Method::PUT)
      && request.url.origin() == endpoint.origin()
      && request.url.path() == endpoint.path()
  }

  /// Queue an order for later delivery.
  pub fn enqueue_order(&self, payload: Value) -> Result<i64> {
    self.outbox.enqueue(payload)
  }

  /// Install, then activate straight away if asked to skip waiting.
  pub async fn handle_install(&self) -> Result<InstallReport> {
    let report = self.lifecycle.install().await;
    if self.lifecycle.is_skipping_waiting() {
      self.handle_activate()?;
    }
    Ok(report)
  }

  /// Wait for background cache refreshes started by earlier requests.
  pub async fn settle(&self) {
    self.cache.settle().await;
  }

  pub fn handle_activate(&self) -> Result<ActivateReport> {
    self.lifecycle.activate()
  }

  pub fn sweep(&self) -> Result<usize> {
    self.lifecycle.sweep()
  }

  /// Background sync. Only the configured tag drains the outbox.
  pub async fn handle_sync(&self, tag: &str) -> Result<Option<DrainReport>> {
    if tag != self.config.sync_tag {
      debug!(tag, "Ignoring unknown sync tag");
      return Ok(None);
    }
    self.outbox.drain().await.map(Some)
  }

  pub fn handle_message(&self, message: Message) -> Result<()> {
    match message {
      Message::PerformanceMetrics { metrics } => self.bridge.forward_metrics(&metrics),
      Message::SkipWaiting => {
        self.lifecycle.skip_waiting();
        if self.lifecycle.state() == LifecycleState::Installed {
          self.handle_activate()?;
        }
      }
      Message::ClearCache => {
        let storage = self.cache.storage();
        for bucket in self.config.current_buckets() {
          if storage.delete_bucket(&bucket)? {
            info!(bucket = bucket.as_str(), "Cleared bucket");
          }
        }
      }
      Message::CacheStatus => {
        for bucket in self.status()?.buckets {
          info!(bucket = bucket.name.as_str(), entries = bucket.entries, "Bucket status");
        }
      }
    }
    Ok(())
  }

  pub fn handle_push(&self, payload: &[u8]) -> Result<Notification> {
    self.bridge.push(payload)
  }

  pub fn handle_notification_click(&self, notification: &Notification) -> Url {
    let target = self.bridge.click_target(notification);
    info!(url = %target, "Opening notification target");
    target
  }

  pub fn status(&self) -> Result<LayerStatus> {
    let storage = self.cache.storage();
    let buckets = storage
      .bucket_names()?
      .into_iter()
      .map(|name| -> Result<BucketStatus> {
        let entries = storage.entries(&name)?.len();
        Ok(BucketStatus { name, entries })
      })
      .collect::<Result<Vec<_>>>()?;

    Ok(LayerStatus {
      state: self.lifecycle.state(),
      passthrough: self.passthrough,
      buckets,
      orders: self.outbox.records()?,
    })
  }

  pub fn purge_synced(&self) -> Result<usize> {
    self.outbox.purge_synced()
  }

  /// Put abandoned orders back in the queue for the next sync.
  pub fn requeue_failed(&self) -> Result<usize> {
    self.outbox.requeue_failed()
  }
}

/// Register the interception layer at application boot.
///
/// If the persistent store cannot be opened the layer still comes up, but every
/// request goes straight to the network.
pub fn register(
  config: Arc<Config>,
  db_path: &Path,
  network: Arc<dyn Network>,
  clock: Arc<dyn Clock>,
  notifier: Arc<dyn Notifier>,
) -> Result<Worker> {
  match SqliteStorage::open(db_path) {
    Ok(storage) => {
      info!(db = %db_path.display(), version = config.version.as_str(), "Interception layer registered");
      Worker::new(config, Arc::new(storage), network, clock, notifier)
    }
    Err(e) => {
      warn!("Registration failed, continuing without caching: {}", e);
      let mut worker = Worker::new(config, Arc::new(NoopStorage), network, clock, notifier)
        .map_err(|e| eyre!("Failed to build passthrough layer: {}", e))?;
      worker.passthrough = true;
      Ok(worker)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, Destination};
  use crate::clock::ManualClock;
  use crate::network::mock::MockNetwork;
  use crate::notify::LogNotifier;
  use serde_json::json;

  const ORIGIN: &str = "https://bistro.test";

  struct Harness {
    worker: Worker,
    network: Arc<MockNetwork>,
    storage: Arc<SqliteStorage>,
    clock: Arc<ManualClock>,
  }

  fn harness_on(storage: Arc<SqliteStorage>, version: &str) -> Harness {
    let yaml = format!(
      "origin: {}/\nversion: {}\nprecache: [/, /offline.html]",
      ORIGIN, version
    );
    let config = Arc::new(Config::from_yaml(&yaml).unwrap());
    let network = Arc::new(MockNetwork::new());
    let clock = Arc::new(ManualClock::new(0));
    let worker = Worker::new(
      config,
      storage.clone(),
      network.clone(),
      clock.clone(),
      Arc::new(LogNotifier),
    )
    .unwrap();
    Harness {
      worker,
      network,
      storage,
      clock,
    }
  }

  fn harness() -> Harness {
    harness_on(Arc::new(SqliteStorage::open_in_memory().unwrap()), "v1")
  }

  fn url(path: &str) -> String {
    format!("{}{}", ORIGIN, path)
  }

  fn get(path: &str, destination: Destination) -> Request {
    Request::get(Url::parse(&url(path)).unwrap(), destination)
  }

  fn order(body: Value) -> Request {
    Request::post_json(Url::parse(&url("/api/orders")).unwrap(), body.to_string().into_bytes())
  }

  #[tokio::test]
  async fn test_get_uses_class_bucket() {
    let h = harness();
    h.network.respond(&url("/assets/app.js"), 200, "js");
    h.worker
      .handle_fetch(get("/assets/app.js", Destination::Script))
      .await
      .unwrap();

    let status = h.worker.status().unwrap();
    assert_eq!(
      status.buckets,
      vec![BucketStatus {
        name: "static-v1".to_string(),
        entries: 1
      }]
    );

    // cache-first: the second request never reaches the network
    let again = h
      .worker
      .handle_fetch(get("/assets/app.js", Destination::Script))
      .await
      .unwrap();
    assert_eq!(again.source, CacheSource::CacheFresh);
    assert_eq!(h.network.call_count(&url("/assets/app.js")), 1);
  }

  #[tokio::test]
  async fn test_offline_navigation_gets_offline_page() {
    let h = harness();
    h.network.respond(&url("/offline.html"), 200, "<p>offline</p>");
    h.worker.handle_install().await.unwrap();
    h.worker.handle_activate().unwrap();

    let result = h
      .worker
      .handle_fetch(get("/menu", Destination::Document))
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Fallback);
    assert_eq!(result.data.text(), "<p>offline</p>");
  }

  #[tokio::test]
  async fn test_failed_order_is_queued_then_synced() {
    let h = harness();
    let queued = h
      .worker
      .handle_fetch(order(json!({"items": ["margherita"]})))
      .await
      .unwrap();
    assert_eq!(queued.source, CacheSource::Queued);
    assert_eq!(queued.data.status, 202);

    h.network.respond(&url("/api/orders"), 201, "{}");
    let report = h.worker.handle_sync("orders-sync").await.unwrap().unwrap();
    assert_eq!(report.synced, 1);

    let status = h.worker.status().unwrap();
    assert_eq!(status.orders_with(OutboxStatus::Synced), 1);
    assert_eq!(status.orders[0].payload, json!({"items": ["margherita"]}));
  }

  #[tokio::test]
  async fn test_reconnect_drains_all_orders_despite_one_failure() {
    let h = harness();
    for n in 1..=3 {
      h.worker.enqueue_order(json!({ "order": n })).unwrap();
    }
    // second delivery fails, first and third succeed
    h.network.respond(&url("/api/orders"), 201, "{}");
    h.network.respond(&url("/api/orders"), 503, "busy");
    h.network.respond(&url("/api/orders"), 201, "{}");

    let report = h.worker.handle_sync("orders-sync").await.unwrap().unwrap();
    assert_eq!(report.attempted, 3);
    assert_eq!(report.synced, 2);
    assert_eq!(report.still_pending, 1);
    assert_eq!(h.network.call_count(&url("/api/orders")), 3);
  }

  #[tokio::test]
  async fn test_offline_navigation_serves_precached_document() {
    let h = harness();
    h.network.respond(&url("/"), 200, "<html>root</html>");
    h.network.respond(&url("/offline.html"), 200, "<p>offline</p>");
    h.worker.handle_install().await.unwrap();
    h.worker.handle_activate().unwrap();

    // same store, nothing reachable
    let offline = harness_on(h.storage.clone(), "v1");
    let root = offline
      .worker
      .handle_fetch(get("/", Destination::Document))
      .await
      .unwrap();
    assert_ne!(root.source, CacheSource::Fallback);
    assert_eq!(root.data.text(), "<html>root</html>");

    let page = offline
      .worker
      .handle_fetch(get("/offline.html", Destination::Empty))
      .await
      .unwrap();
    assert_ne!(page.source, CacheSource::Fallback);
    assert_eq!(page.data.text(), "<p>offline</p>");
  }

  #[tokio::test]
  async fn test_order_answered_with_server_error_is_queued() {
    let h = harness();
    h.network.respond(&url("/api/orders"), 503, "kitchen overloaded");
    let result = h
      .worker
      .handle_fetch(order(json!({"items": ["tiramisu"]})))
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Queued);
    assert_eq!(h.worker.status().unwrap().orders_with(OutboxStatus::Pending), 1);
  }

  #[tokio::test]
  async fn test_order_refused_by_server_is_not_queued() {
    let h = harness();
    h.network.respond(&url("/api/orders"), 422, "unknown dish");
    let result = h
      .worker
      .handle_fetch(order(json!({"items": ["kale smoothie"]})))
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.status, 422);
    assert!(h.worker.status().unwrap().orders.is_empty());
  }

  #[tokio::test]
  async fn test_skip_waiting_in_a_later_process() {
    let h = harness();
    h.worker.handle_install().await.unwrap();

    let later = harness_on(h.storage.clone(), "v1");
    assert_eq!(later.worker.status().unwrap().state, LifecycleState::Installed);
    later.worker.handle_message(Message::SkipWaiting).unwrap();

    let after = harness_on(h.storage.clone(), "v1");
    assert_eq!(after.worker.status().unwrap().state, LifecycleState::Activated);
  }

  #[tokio::test]
  async fn test_other_writes_propagate_failure() {
    let h = harness();
    let request = Request::post_json(Url::parse(&url("/api/feedback")).unwrap(), b"{}".to_vec());
    assert!(h.worker.handle_fetch(request).await.is_err());
    assert!(h.worker.status().unwrap().orders.is_empty());
  }

  #[tokio::test]
  async fn test_unknown_sync_tag_is_ignored() {
    let h = harness();
    h.worker.enqueue_order(json!({})).unwrap();
    assert!(h.worker.handle_sync("photos-sync").await.unwrap().is_none());
    assert!(h.network.calls().is_empty());
  }

  #[tokio::test]
  async fn test_version_isolation() {
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let v1 = harness_on(storage.clone(), "v1");
    v1.network.respond(&url("/api/menu"), 200, "v1 menu");
    v1.worker
      .handle_fetch(get("/api/menu", Destination::Empty))
      .await
      .unwrap();
    assert!(v1.storage.bucket_names().unwrap().contains(&"api-v1".to_string()));

    let v2 = harness_on(storage.clone(), "v2");
    let report = v2.worker.handle_activate().unwrap();
    assert_eq!(report.deleted_buckets, vec!["api-v1"]);

    // a cache-only read against the retired name is a guaranteed miss
    let key = crate::cache::RequestKey::new(&Url::parse(&url("/api/menu")).unwrap());
    assert!(storage.read("api-v1", &key).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_skip_waiting_activates_installed_layer() {
    let h = harness();
    h.worker.handle_install().await.unwrap();
    assert_eq!(h.worker.status().unwrap().state, LifecycleState::Installed);
    h.worker.handle_message(Message::SkipWaiting).unwrap();
    assert_eq!(h.worker.status().unwrap().state, LifecycleState::Activated);
  }

  #[tokio::test]
  async fn test_clear_cache_message() {
    let h = harness();
    h.network.respond(&url("/api/menu"), 200, "menu");
    h.worker
      .handle_fetch(get("/api/menu", Destination::Empty))
      .await
      .unwrap();
    h.worker.handle_message(Message::ClearCache).unwrap();
    assert!(h.worker.status().unwrap().buckets.is_empty());
  }

  #[tokio::test]
  async fn test_activate_sweeps_expired_entries() {
    let h = harness();
    h.network.respond(&url("/api/menu"), 200, "menu");
    h.worker
      .handle_fetch(get("/api/menu", Destination::Empty))
      .await
      .unwrap();

    h.clock.advance(h.worker.config().policy(crate::classify::ResourceClass::Api).max_age_ms + 1);
    let report = h.worker.handle_activate().unwrap();
    assert_eq!(report.expired_entries, 1);
  }

  #[tokio::test]
  async fn test_registration_failure_falls_back_to_network() {
    let dir = std::env::temp_dir().join(format!("tablecache-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    // a directory cannot be opened as a database
    let network = Arc::new(MockNetwork::new());
    network.respond(&url("/api/menu"), 200, "live");
    let worker = register(
      Arc::new(Config::from_yaml(&format!("origin: {}/", ORIGIN)).unwrap()),
      &dir,
      network.clone(),
      Arc::new(ManualClock::new(0)),
      Arc::new(LogNotifier),
    )
    .unwrap();

    assert!(worker.is_passthrough());
    let result = worker
      .handle_fetch(get("/api/menu", Destination::Empty))
      .await
      .unwrap();
    assert_eq!(result.source, CacheSource::Network);
    std::fs::remove_dir_all(&dir).ok();
  }
}
