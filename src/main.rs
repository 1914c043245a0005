mod cache;
mod classify;
mod clock;
mod config;
mod event;
mod fallback;
mod lifecycle;
mod network;
mod notify;
mod outbox;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use url::Url;

use cache::{Destination, Request};
use event::{Event, EventHandler};
use notify::{LogNotifier, Message, Notification};
use outbox::OutboxStatus;

#[derive(Parser, Debug)]
#[command(name = "tablecache")]
#[command(about = "Offline-first request cache and order outbox for a restaurant ordering app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/tablecache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Path to the cache database (default: $XDG_DATA_HOME/tablecache/cache.db)
  #[arg(long)]
  db: Option<PathBuf>,

  /// Write logs to this file instead of stderr
  #[arg(long)]
  log_file: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Pre-cache the baseline asset manifest
  Install,
  /// Retire buckets from other versions and sweep expired entries
  Activate,
  /// Send requests through the interception layer
  Fetch {
    /// URLs or application paths
    #[arg(required = true)]
    urls: Vec<String>,
    #[arg(long, value_enum, default_value_t = Destination::Empty)]
    dest: Destination,
  },
  /// Queue an order (JSON) for later delivery
  Enqueue { payload: String },
  /// Signal renewed connectivity
  Sync {
    #[arg(long)]
    tag: Option<String>,
    /// Give failed orders another chance before draining
    #[arg(long)]
    requeue: bool,
  },
  /// Delete expired cache entries
  Sweep,
  /// Show buckets and queued orders
  Status {
    /// Also delete delivered orders
    #[arg(long)]
    purge: bool,
  },
  /// Deliver a push payload
  Push {
    payload: String,
    /// Also simulate the user clicking the notification
    #[arg(long)]
    click: bool,
  },
  /// Deliver a foreground message, e.g. '{"type":"SKIP_WAITING"}'
  Message { json: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _log_guard = init_tracing(args.log_file.as_deref())?;

  let config = Arc::new(config::Config::load(args.config.as_deref())?);
  let db_path = match args.db {
    Some(path) => path,
    None => config::Config::default_db_path()?,
  };

  let worker = worker::register(
    config.clone(),
    &db_path,
    Arc::new(network::HttpNetwork::new()?),
    Arc::new(clock::SystemClock),
    Arc::new(LogNotifier),
  )?;

  match args.command {
    Command::Install => {
      let report = worker.handle_install().await?;
      println!("cached {} asset(s)", report.cached.len());
      for path in report.failed {
        println!("  failed: {}", path);
      }
    }
    Command::Activate => {
      let report = worker.handle_activate()?;
      for bucket in &report.deleted_buckets {
        println!("deleted bucket {}", bucket);
      }
      println!("swept {} expired entr(ies)", report.expired_entries);
    }
    Command::Fetch { urls, dest } => {
      let events = EventHandler::new(worker.clone());
      let requests = urls
        .iter()
        .map(|raw| resolve_url(&config, raw).map(|url| Request::get(url, dest)))
        .collect::<Result<Vec<_>>>()?;

      let results = futures::future::join_all(requests.into_iter().map(|request| {
        let url = request.url.clone();
        let events = &events;
        async move { (url, events.fetch(request).await) }
      }))
      .await;

      for (url, result) in results {
        match result {
          Ok(result) => println!(
            "{} {} {:?} ({} bytes)",
            result.data.status,
            url,
            result.source,
            result.data.body.len()
          ),
          Err(e) => println!("ERR {} {}", url, e),
        }
      }
      events.shutdown().await?;
    }
    Command::Enqueue { payload } => {
      let payload: serde_json::Value =
        serde_json::from_str(&payload).map_err(|e| eyre!("Order is not valid JSON: {}", e))?;
      let id = worker.enqueue_order(payload)?;
      println!("queued order {}", id);
    }
    Command::Sync { tag, requeue } => {
      if requeue {
        println!("requeued {} failed order(s)", worker.requeue_failed()?);
      }
      let tag = tag.unwrap_or_else(|| config.sync_tag.clone());
      match worker.handle_sync(&tag).await? {
        Some(report) => println!(
          "attempted {}, synced {}, pending {}, failed {}",
          report.attempted, report.synced, report.still_pending, report.failed
        ),
        None => println!("nothing registered for tag {}", tag),
      }
    }
    Command::Sweep => {
      println!("swept {} expired entr(ies)", worker.sweep()?);
    }
    Command::Status { purge } => {
      if purge {
        println!("purged {} delivered order(s)", worker.purge_synced()?);
      }
      let status = worker.status()?;
      println!("state: {:?}", status.state);
      if status.passthrough {
        println!("passthrough: cache unavailable, requests go straight to the network");
      }
      for bucket in &status.buckets {
        println!("{:<24} {:>6} entries", bucket.name, bucket.entries);
      }
      println!(
        "orders: {} pending, {} synced, {} failed",
        status.orders_with(OutboxStatus::Pending),
        status.orders_with(OutboxStatus::Synced),
        status.orders_with(OutboxStatus::Failed)
      );
    }
    Command::Push { payload, click } => {
      let events = EventHandler::new(worker.clone());
      if click {
        let notification = Notification::from_push(payload.as_bytes());
        events.send(Event::Push(payload.into_bytes()))?;
        events.send(Event::NotificationClick(notification))?;
      } else {
        events.send(Event::Push(payload.into_bytes()))?;
      }
      events.shutdown().await?;
    }
    Command::Message { json } => {
      let events = EventHandler::new(worker.clone());
      events.send(Event::Message(Message::parse(&json)?))?;
      events.shutdown().await?;
    }
  }

  Ok(())
}

/// Accept absolute URLs or paths relative to the configured origin.
fn resolve_url(config: &config::Config, raw: &str) -> Result<Url> {
  match Url::parse(raw) {
    Ok(url) => Ok(url),
    Err(_) => config.resolve(raw),
  }
}

fn init_tracing(log_file: Option<&Path>) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tablecache=info,telemetry=info"));

  match log_file {
    Some(path) => {
      let directory = path.parent().unwrap_or_else(|| Path::new("."));
      let file_name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
      let appender = tracing_appender::rolling::never(directory, file_name);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
      Ok(Some(guard))
    }
    None => {
      tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
      Ok(None)
    }
  }
}
