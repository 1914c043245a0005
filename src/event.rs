use color_eyre::{eyre::eyre, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info};

use crate::cache::{CacheResult, Request};
use crate::notify::{Message, Notification};
use crate::worker::Worker;

/// Platform events delivered to the interception layer
#[derive(Debug)]
pub enum Event {
  /// Layer installed; pre-cache the baseline manifest
  Install,
  /// Layer taking control; retire old buckets
  Activate,
  /// Intercepted outgoing request
  Fetch {
    request: Request,
    reply: oneshot::Sender<Result<CacheResult>>,
  },
  /// Connectivity-dependent background work (e.g. "orders-sync")
  Sync { tag: String },
  /// Message from the foreground application
  Message(Message),
  /// Push payload
  Push(Vec<u8>),
  NotificationClick(Notification),
}

/// Adapter that routes platform events into the worker's handlers.
///
/// Lifecycle events are handled in arrival order; requests, syncs and pushes
/// each run in their own task. A failing handler is logged and never stops the loop.
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  task: JoinHandle<()>,
  worker: Worker,
}

impl EventHandler {
  pub fn new(worker: Worker) -> Self {
    let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
    let handle = worker.clone();

    let task = tokio::spawn(async move {
      let mut tasks = JoinSet::new();

      while let Some(event) = rx.recv().await {
        match event {
          Event::Install => match worker.handle_install().await {
            Ok(report) => info!(
              cached = report.cached.len(),
              failed = report.failed.len(),
              "Install handled"
            ),
            Err(e) => error!("Install handler failed: {:?}", e),
          },
          Event::Activate => match worker.handle_activate() {
            Ok(report) => info!(
              deleted = report.deleted_buckets.len(),
              expired = report.expired_entries,
              "Activate handled"
            ),
            Err(e) => error!("Activate handler failed: {:?}", e),
          },
          Event::Message(message) => {
            if let Err(e) = worker.handle_message(message) {
              error!("Message handler failed: {:?}", e);
            }
          }
          Event::NotificationClick(notification) => {
            worker.handle_notification_click(&notification);
          }
          Event::Fetch { request, reply } => {
            let worker = worker.clone();
            tasks.spawn(async move {
              let result = worker.handle_fetch(request).await;
              if let Err(e) = &result {
                error!("Fetch handler failed: {}", e);
              }
              // Ignore send errors - requester may have gone away
              let _ = reply.send(result);
            });
          }
          Event::Sync { tag } => {
            let worker = worker.clone();
            tasks.spawn(async move {
              if let Err(e) = worker.handle_sync(&tag).await {
                error!(tag = tag.as_str(), "Sync handler failed: {:?}", e);
              }
            });
          }
          Event::Push(payload) => {
            let worker = worker.clone();
            tasks.spawn(async move {
              if let Err(e) = worker.handle_push(&payload) {
                error!("Push handler failed: {:?}", e);
              }
            });
          }
        }

        // Reap finished tasks so panics surface promptly
        while let Some(joined) = tasks.try_join_next() {
          if let Err(e) = joined {
            error!("Event task aborted: {}", e);
          }
        }
      }

      while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
          error!("Event task aborted: {}", e);
        }
      }
    });

    Self {
      tx,
      task,
      worker: handle,
    }
  }

  /// Deliver an event.
  pub fn send(&self, event: Event) -> Result<()> {
    self
      .tx
      .send(event)
      .map_err(|_| eyre!("Event loop has stopped"))
  }

  /// Deliver an intercepted request and wait for its response.
  pub async fn fetch(&self, request: Request) -> Result<CacheResult> {
    let (reply, response) = oneshot::channel();
    self.send(Event::Fetch { request, reply })?;
    response
      .await
      .map_err(|_| eyre!("Fetch handler dropped the request"))?
  }

  /// Stop accepting events and wait for in-flight handlers and the cache
  /// refreshes they started to finish.
  pub async fn shutdown(self) -> Result<()> {
    let Self { tx, task, worker } = self;
    drop(tx);
    task
      .await
      .map_err(|e| eyre!("Event loop crashed: {}", e))?;
    worker.settle().await;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, CacheStorage, Destination, RequestKey, SqliteStorage};
  use crate::clock::ManualClock;
  use crate::config::Config;
  use crate::network::mock::MockNetwork;
  use crate::notify::LogNotifier;
  use serde_json::json;
  use std::sync::Arc;
  use url::Url;

  fn setup() -> (EventHandler, Worker, Arc<MockNetwork>) {
    setup_on(Arc::new(SqliteStorage::open_in_memory().unwrap()))
  }

  fn setup_on(storage: Arc<SqliteStorage>) -> (EventHandler, Worker, Arc<MockNetwork>) {
    let config = Arc::new(Config::from_yaml("origin: https://bistro.test/\nprecache: []").unwrap());
    let network = Arc::new(MockNetwork::new());
    let worker = Worker::new(
      config,
      storage,
      network.clone(),
      Arc::new(ManualClock::new(0)),
      Arc::new(LogNotifier),
    )
    .unwrap();
    (EventHandler::new(worker.clone()), worker, network)
  }

  #[tokio::test]
  async fn test_fetch_round_trip() {
    let (events, _, network) = setup();
    network.respond("https://bistro.test/api/menu", 200, "menu");

    let request = Request::get(
      Url::parse("https://bistro.test/api/menu").unwrap(),
      Destination::Empty,
    );
    let result = events.fetch(request).await.unwrap();
    assert_eq!(result.source, CacheSource::Network);
    events.shutdown().await.unwrap();
  }

  #[tokio::test]
  async fn test_failing_handler_does_not_stop_loop() {
    let (events, _, network) = setup();

    // a non-order write with no network fails outright
    let write = Request::post_json(
      Url::parse("https://bistro.test/api/feedback").unwrap(),
      b"{}".to_vec(),
    );
    assert!(events.fetch(write).await.is_err());
    events
      .send(Event::Message(Message::PerformanceMetrics { metrics: json!({}) }))
      .unwrap();

    network.respond("https://bistro.test/api/menu", 200, "menu");
    let request = Request::get(
      Url::parse("https://bistro.test/api/menu").unwrap(),
      Destination::Empty,
    );
    assert!(events.fetch(request).await.is_ok());
    events.shutdown().await.unwrap();
  }

  #[tokio::test]
  async fn test_sync_event_drains_outbox() {
    let (events, worker, network) = setup();
    worker.enqueue_order(json!({"order": 1})).unwrap();
    network.respond("https://bistro.test/api/orders", 201, "{}");

    events.send(Event::Install).unwrap();
    events.send(Event::Activate).unwrap();
    events
      .send(Event::Sync {
        tag: "orders-sync".to_string(),
      })
      .unwrap();
    events.shutdown().await.unwrap();

    let status = worker.status().unwrap();
    assert_eq!(status.orders_with(crate::outbox::OutboxStatus::Synced), 1);
  }

  #[test]
  fn test_shutdown_finishes_background_refresh() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let storage = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let menu = Url::parse("https://bistro.test/menu").unwrap();

    runtime.block_on(async {
      let (events, _, network) = setup_on(storage.clone());
      network.respond(menu.as_str(), 200, "old");
      network.respond(menu.as_str(), 200, "new");

      let first = events
        .fetch(Request::get(menu.clone(), Destination::Document))
        .await
        .unwrap();
      assert_eq!(first.data.body, b"old");

      // the refresh is still parked on the network when the answer comes back
      network.hold();
      let second = events
        .fetch(Request::get(menu.clone(), Destination::Document))
        .await
        .unwrap();
      assert_eq!(second.data.body, b"old");
      network.release();

      events.shutdown().await.unwrap();
    });
    drop(runtime);

    let entry = storage
      .read("page-v1", &RequestKey::new(&menu))
      .unwrap()
      .unwrap();
    assert_eq!(entry.response.body, b"new");
  }
}
