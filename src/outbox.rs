//! Offline mutation queue for order submissions.
//!
//! Orders that cannot reach the network are persisted as outbox records and
//! replayed in FIFO order when the platform signals renewed connectivity. Each
//! record's delivery is independent: one failure never blocks the rest.
//!
//! One rule decides what "could not deliver" means, both when an order is first
//! submitted and when it is replayed: a transport error or a 5xx answer. Any
//! other answer came from a server that took a decision about the order.

use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{NoopStorage, Request, SqliteStorage};
use crate::clock::Clock;
use crate::network::Network;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
  /// Waiting for delivery
  Pending,
  /// Delivered (terminal)
  Synced,
  /// Rejected by the endpoint, or out of attempts under `outbox.max_attempts`.
  /// Drains skip these until `requeue_failed` puts them back to pending.
  Failed,
}

impl OutboxStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      OutboxStatus::Pending => "pending",
      OutboxStatus::Synced => "synced",
      OutboxStatus::Failed => "failed",
    }
  }

  fn parse(s: &str) -> Result<Self> {
    match s {
      "pending" => Ok(OutboxStatus::Pending),
      "synced" => Ok(OutboxStatus::Synced),
      "failed" => Ok(OutboxStatus::Failed),
      other => Err(eyre!("Unknown outbox status '{}'", other)),
    }
  }
}

/// Whether an answer from the orders endpoint means the order was not taken.
pub fn is_undeliverable(status: u16) -> bool {
  status >= 500
}

/// A write operation awaiting delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxRecord {
  pub id: i64,
  pub payload: Value,
  pub enqueued_at: i64,
  pub attempts: u32,
  pub status: OutboxStatus,
  pub last_error: Option<String>,
}

/// Persistent storage for outbox records.
///
/// Status only moves forward: `pending -> synced` or `pending -> failed`.
pub trait OutboxStore: Send + Sync {
  /// Persist a new pending record and return its id.
  fn insert(&self, payload: &Value, enqueued_at: i64) -> Result<i64>;

  /// Pending records, oldest first.
  fn pending(&self) -> Result<Vec<OutboxRecord>>;

  /// Every record, oldest first.
  fn all(&self) -> Result<Vec<OutboxRecord>>;

  /// Record a successful delivery.
  fn mark_synced(&self, id: i64) -> Result<()>;

  /// Record a failed delivery. With `give_up` the record is parked as failed.
  fn record_failure(&self, id: i64, error: &str, give_up: bool) -> Result<()>;

  /// Delete delivered records. Returns how many were removed.
  fn purge_synced(&self) -> Result<usize>;

  /// Move failed records back to pending with a fresh attempt count.
  fn requeue_failed(&self) -> Result<usize>;
}

fn query_records(storage: &SqliteStorage, sql: &str) -> Result<Vec<OutboxRecord>> {
  let conn = storage.lock()?;
  let mut stmt = conn
    .prepare(sql)
    .map_err(|e| eyre!("Failed to prepare outbox query: {}", e))?;

  let rows: Vec<(i64, String, i64, u32, String, Option<String>)> = stmt
    .query_map([], |row| {
      Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
      ))
    })
    .map_err(|e| eyre!("Failed to query outbox: {}", e))?
    .collect::<rusqlite::Result<_>>()
    .map_err(|e| eyre!("Failed to read outbox: {}", e))?;

  rows
    .into_iter()
    .map(|(id, payload, enqueued_at, attempts, status, last_error)| {
      Ok(OutboxRecord {
        id,
        payload: serde_json::from_str(&payload)
          .map_err(|e| eyre!("Failed to decode outbox record {}: {}", id, e))?,
        enqueued_at,
        attempts,
        status: OutboxStatus::parse(&status)?,
        last_error,
      })
    })
    .collect()
}

const RECORD_COLUMNS: &str = "id, payload, enqueued_at, attempts, status, last_error";

impl OutboxStore for SqliteStorage {
  fn insert(&self, payload: &Value, enqueued_at: i64) -> Result<i64> {
    let payload =
      serde_json::to_string(payload).map_err(|e| eyre!("Failed to encode payload: {}", e))?;
    let conn = self.lock()?;
    conn
      .execute(
        "INSERT INTO outbox (payload, enqueued_at, attempts, status) VALUES (?, ?, 0, 'pending')",
        params![payload, enqueued_at],
      )
      .map_err(|e| eyre!("Failed to enqueue outbox record: {}", e))?;
    Ok(conn.last_insert_rowid())
  }

  fn pending(&self) -> Result<Vec<OutboxRecord>> {
    query_records(
      self,
      &format!(
        "SELECT {} FROM outbox WHERE status = 'pending' ORDER BY id",
        RECORD_COLUMNS
      ),
    )
  }

  fn all(&self) -> Result<Vec<OutboxRecord>> {
    query_records(self, &format!("SELECT {} FROM outbox ORDER BY id", RECORD_COLUMNS))
  }

  fn mark_synced(&self, id: i64) -> Result<()> {
    self
      .lock()?
      .execute(
        "UPDATE outbox SET status = 'synced', attempts = attempts + 1, last_error = NULL
         WHERE id = ? AND status = 'pending'",
        params![id],
      )
      .map_err(|e| eyre!("Failed to mark record {} synced: {}", id, e))?;
    Ok(())
  }

  fn record_failure(&self, id: i64, error: &str, give_up: bool) -> Result<()> {
    let status = if give_up {
      OutboxStatus::Failed
    } else {
      OutboxStatus::Pending
    };
    self
      .lock()?
      .execute(
        "UPDATE outbox SET attempts = attempts + 1, last_error = ?, status = ?
         WHERE id = ? AND status = 'pending'",
        params![error, status.as_str(), id],
      )
      .map_err(|e| eyre!("Failed to record failure for {}: {}", id, e))?;
    Ok(())
  }

  fn purge_synced(&self) -> Result<usize> {
    self
      .lock()?
      .execute("DELETE FROM outbox WHERE status = 'synced'", [])
      .map_err(|e| eyre!("Failed to purge outbox: {}", e))
  }

  fn requeue_failed(&self) -> Result<usize> {
    self
      .lock()?
      .execute(
        "UPDATE outbox SET status = 'pending', attempts = 0 WHERE status = 'failed'",
        [],
      )
      .map_err(|e| eyre!("Failed to requeue failed orders: {}", e))
  }
}

impl OutboxStore for NoopStorage {
  fn insert(&self, _payload: &Value, _enqueued_at: i64) -> Result<i64> {
    Err(eyre!("Offline queue unavailable"))
  }

  fn pending(&self) -> Result<Vec<OutboxRecord>> {
    Ok(Vec::new())
  }

  fn all(&self) -> Result<Vec<OutboxRecord>> {
    Ok(Vec::new())
  }

  fn mark_synced(&self, _id: i64) -> Result<()> {
    Ok(())
  }

  fn record_failure(&self, _id: i64, _error: &str, _give_up: bool) -> Result<()> {
    Ok(())
  }

  fn purge_synced(&self) -> Result<usize> {
    Ok(0)
  }

  fn requeue_failed(&self) -> Result<usize> {
    Ok(0)
  }
}

enum Delivery {
  Delivered,
  /// Not taken; try again on the next drain
  Undelivered(String),
  /// The endpoint answered and refused the order
  Rejected(String),
}

/// Outcome of one drain pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainReport {
  pub attempted: usize,
  pub synced: usize,
  pub still_pending: usize,
  pub failed: usize,
}

/// Queue of orders awaiting delivery, drained on reconnect.
pub struct Outbox {
  store: Arc<dyn OutboxStore>,
  network: Arc<dyn Network>,
  clock: Arc<dyn Clock>,
  endpoint: Url,
  max_attempts: Option<u32>,
  drain_lock: tokio::sync::Mutex<()>,
}

impl Outbox {
  pub fn new(
    store: Arc<dyn OutboxStore>,
    network: Arc<dyn Network>,
    clock: Arc<dyn Clock>,
    endpoint: Url,
    max_attempts: Option<u32>,
  ) -> Self {
    Self {
      store,
      network,
      clock,
      endpoint,
      max_attempts,
      drain_lock: tokio::sync::Mutex::new(()),
    }
  }

  pub fn endpoint(&self) -> &Url {
    &self.endpoint
  }

  /// Persist an order for later delivery.
  pub fn enqueue(&self, payload: Value) -> Result<i64> {
    let id = self.store.insert(&payload, self.clock.now_millis())?;
    info!(id, "Order queued for delivery");
    Ok(id)
  }

  pub fn records(&self) -> Result<Vec<OutboxRecord>> {
    self.store.all()
  }

  pub fn purge_synced(&self) -> Result<usize> {
    self.store.purge_synced()
  }

  pub fn requeue_failed(&self) -> Result<usize> {
    let count = self.store.requeue_failed()?;
    if count > 0 {
      info!(count, "Failed orders requeued");
    }
    Ok(count)
  }

  /// Attempt delivery of every pending record, oldest first.
  ///
  /// Concurrent drains are serialised so a record is never delivered twice by
  /// overlapping reconnect signals.
  pub async fn drain(&self) -> Result<DrainReport> {
    let _guard = self.drain_lock.lock().await;
    let mut report = DrainReport::default();

    for record in self.store.pending()? {
      report.attempted += 1;

      let attempts = record.attempts + 1;
      let (message, give_up) = match self.deliver(&record).await {
        Delivery::Delivered => {
          if let Err(e) = self.store.mark_synced(record.id) {
            warn!(id = record.id, "Delivered but failed to mark synced: {}", e);
          }
          report.synced += 1;
          info!(id = record.id, "Order delivered");
          continue;
        }
        Delivery::Undelivered(message) => {
          (message, self.max_attempts.is_some_and(|max| attempts >= max))
        }
        Delivery::Rejected(message) => (message, true),
      };

      if let Err(store_err) = self.store.record_failure(record.id, &message, give_up) {
        warn!(id = record.id, "Failed to record delivery failure: {}", store_err);
      }
      if give_up {
        report.failed += 1;
        warn!(id = record.id, attempts, "Order delivery abandoned: {}", message);
      } else {
        report.still_pending += 1;
        debug!(id = record.id, attempts, "Order delivery failed, will retry: {}", message);
      }
    }

    info!(
      attempted = report.attempted,
      synced = report.synced,
      pending = report.still_pending,
      failed = report.failed,
      "Outbox drained"
    );
    Ok(report)
  }

  async fn deliver(&self, record: &OutboxRecord) -> Delivery {
    let body = match serde_json::to_vec(&record.payload) {
      Ok(body) => body,
      Err(e) => return Delivery::Rejected(format!("Failed to encode order: {}", e)),
    };
    let request = Request::post_json(self.endpoint.clone(), body);

    match self.network.fetch(&request).await {
      Ok(response) if response.is_success() => Delivery::Delivered,
      Ok(response) if is_undeliverable(response.status) => {
        Delivery::Undelivered(format!("Order endpoint answered {}", response.status))
      }
      Ok(response) => Delivery::Rejected(format!("Order endpoint refused it with {}", response.status)),
      Err(e) => Delivery::Undelivered(e.to_string()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::Response;
  use crate::clock::ManualClock;
  use async_trait::async_trait;
  use serde_json::json;
  use std::sync::Mutex;

  /// Network that answers order posts according to the order's "fail" flag.
  #[derive(Default)]
  struct OrderEndpoint {
    received: Mutex<Vec<Value>>,
  }

  #[async_trait]
  impl Network for OrderEndpoint {
    async fn fetch(&self, request: &Request) -> Result<Response> {
      let body: Value = serde_json::from_slice(request.body.as_deref().unwrap_or_default())?;
      self.received.lock().unwrap().push(body.clone());
      match body["fail"].as_str() {
        Some("offline") => Err(eyre!("network unreachable")),
        Some("busy") => Ok(Response::new(503, "try later")),
        Some("reject") => Ok(Response::new(422, "unknown dish")),
        _ => Ok(Response::new(201, "{}")),
      }
    }
  }

  fn outbox(max_attempts: Option<u32>) -> (Outbox, Arc<OrderEndpoint>, Arc<SqliteStorage>) {
    let store = Arc::new(SqliteStorage::open_in_memory().unwrap());
    let network = Arc::new(OrderEndpoint::default());
    let outbox = Outbox::new(
      store.clone(),
      network.clone(),
      Arc::new(ManualClock::new(1_000)),
      Url::parse("https://bistro.test/api/orders").unwrap(),
      max_attempts,
    );
    (outbox, network, store)
  }

  #[tokio::test]
  async fn test_failure_does_not_block_later_records() {
    let (outbox, network, _) = outbox(None);
    outbox.enqueue(json!({"order": 1})).unwrap();
    outbox.enqueue(json!({"order": 2, "fail": "offline"})).unwrap();
    outbox.enqueue(json!({"order": 3})).unwrap();

    let report = outbox.drain().await.unwrap();
    assert_eq!(
      report,
      DrainReport {
        attempted: 3,
        synced: 2,
        still_pending: 1,
        failed: 0
      }
    );

    // FIFO delivery order
    let orders: Vec<i64> = network
      .received
      .lock()
      .unwrap()
      .iter()
      .map(|v| v["order"].as_i64().unwrap())
      .collect();
    assert_eq!(orders, vec![1, 2, 3]);

    let records = outbox.records().unwrap();
    assert_eq!(records[0].status, OutboxStatus::Synced);
    assert_eq!(records[1].status, OutboxStatus::Pending);
    assert_eq!(records[1].attempts, 1);
    assert!(records[1].last_error.is_some());
    assert_eq!(records[2].status, OutboxStatus::Synced);
    assert_eq!(records[0].enqueued_at, 1_000);
  }

  #[tokio::test]
  async fn test_unbounded_retry_keeps_record_pending() {
    let (outbox, _, _) = outbox(None);
    outbox.enqueue(json!({"fail": "busy"})).unwrap();

    for _ in 0..5 {
      outbox.drain().await.unwrap();
    }
    let record = &outbox.records().unwrap()[0];
    assert_eq!(record.status, OutboxStatus::Pending);
    assert_eq!(record.attempts, 5);
  }

  #[tokio::test]
  async fn test_attempt_cap_parks_record_as_failed() {
    let (outbox, network, _) = outbox(Some(2));
    outbox.enqueue(json!({"fail": "offline"})).unwrap();

    assert_eq!(outbox.drain().await.unwrap().still_pending, 1);
    assert_eq!(outbox.drain().await.unwrap().failed, 1);
    assert_eq!(outbox.drain().await.unwrap().attempted, 0);
    assert_eq!(network.received.lock().unwrap().len(), 2);
    assert_eq!(outbox.records().unwrap()[0].status, OutboxStatus::Failed);
  }

  #[tokio::test]
  async fn test_refused_order_is_failed_at_once() {
    let (outbox, network, _) = outbox(None);
    outbox.enqueue(json!({"order": 1, "fail": "reject"})).unwrap();

    let report = outbox.drain().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.still_pending, 0);

    let record = &outbox.records().unwrap()[0];
    assert_eq!(record.status, OutboxStatus::Failed);
    assert_eq!(record.last_error.as_deref(), Some("Order endpoint refused it with 422"));

    // not retried by later drains
    outbox.drain().await.unwrap();
    assert_eq!(network.received.lock().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_requeue_makes_failed_orders_retryable() {
    let (outbox, network, _) = outbox(Some(1));
    outbox.enqueue(json!({"order": 1, "fail": "offline"})).unwrap();
    outbox.enqueue(json!({"order": 2})).unwrap();

    assert_eq!(outbox.drain().await.unwrap().failed, 1);
    assert_eq!(outbox.requeue_failed().unwrap(), 1);

    let record = &outbox.records().unwrap()[0];
    assert_eq!(record.status, OutboxStatus::Pending);
    assert_eq!(record.attempts, 0);

    let report = outbox.drain().await.unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(network.received.lock().unwrap().len(), 3);

    // synced records are never requeued
    assert_eq!(outbox.requeue_failed().unwrap(), 1);
    assert_eq!(outbox.records().unwrap()[1].status, OutboxStatus::Synced);
  }

  #[test]
  fn test_only_server_errors_are_undeliverable() {
    assert!(is_undeliverable(500));
    assert!(is_undeliverable(503));
    assert!(!is_undeliverable(201));
    assert!(!is_undeliverable(409));
  }

  #[tokio::test]
  async fn test_synced_records_are_not_redelivered() {
    let (outbox, network, store) = outbox(None);
    let id = outbox.enqueue(json!({"order": 1})).unwrap();
    outbox.drain().await.unwrap();
    outbox.drain().await.unwrap();
    assert_eq!(network.received.lock().unwrap().len(), 1);

    // synced never regresses
    store.record_failure(id, "late failure", false).unwrap();
    assert_eq!(outbox.records().unwrap()[0].status, OutboxStatus::Synced);

    assert_eq!(outbox.purge_synced().unwrap(), 1);
    assert!(outbox.records().unwrap().is_empty());
  }

  #[test]
  fn test_noop_store_refuses_orders() {
    let outbox = Outbox::new(
      Arc::new(NoopStorage),
      Arc::new(OrderEndpoint::default()),
      Arc::new(ManualClock::new(0)),
      Url::parse("https://bistro.test/api/orders").unwrap(),
      None,
    );
    assert!(outbox.enqueue(json!({})).is_err());
  }
}
