use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use coachsync::cache::TtlCacheBuilder;
use coachsync::config::Config;
use coachsync::connectivity::{ConnectivityProbe, HttpProbe};
use coachsync::logging;
use coachsync::store::{PersistentStore, SqliteStore, KEY_PREFIX};
use coachsync::sync::{HttpRemoteStore, SyncQueue};
use coachsync::{ActionRegistry, ConnectivityMonitor, TtlCache};

#[derive(Parser, Debug)]
#[command(name = "coachsync")]
#[command(about = "Inspect and drive the offline sync queue of the coaching client")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/coachsync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Show queue and cache summary
  Status,
  /// List queued writes in order
  List,
  /// Queue a write without sending it
  Enqueue {
    /// Action tag, e.g. create-record
    action: String,
    /// JSON payload
    payload: String,
  },
  /// Send queued writes to the remote store
  Drain,
  /// Drop cached reads, optionally only keys starting with PREFIX
  CacheClear { prefix: Option<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = logging::setup_logging(&logging::default_log_dir());

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  let path = match &config.storage.path {
    Some(path) => path.clone(),
    None => SqliteStore::default_path()?,
  };
  let store = Arc::new(SqliteStore::open_at(&path)?.with_max_bytes(config.storage.max_bytes));

  match args.command {
    Command::Status => status(&config, store),
    Command::List => list(&config, store),
    Command::Enqueue { action, payload } => enqueue(&config, store, action, &payload),
    Command::Drain => drain(&config, store).await,
    Command::CacheClear { prefix } => cache_clear(&config, store, prefix.as_deref()),
  }
}

/// Queue bound to the store, with no executors and no automatic drains.
fn offline_queue(config: &Config, store: Arc<SqliteStore>) -> SyncQueue {
  SyncQueue::builder(ActionRegistry::new())
    .connectivity(ConnectivityMonitor::with_initial(false))
    .options(config.sync.options())
    .store(store)
    .build()
}

fn cache_namespaces(config: &Config, store: &SqliteStore) -> Result<Vec<String>> {
  let prefix = format!("{KEY_PREFIX}:cache:");
  let mut namespaces: Vec<String> = store
    .keys(&prefix)?
    .into_iter()
    .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
    .chain(config.cache.namespaces.keys().cloned())
    .collect();
  namespaces.sort();
  namespaces.dedup();
  Ok(namespaces)
}

fn open_cache(config: &Config, store: &Arc<SqliteStore>, namespace: &str) -> TtlCache<serde_json::Value> {
  TtlCacheBuilder::new(namespace)
    .capacity(config.cache.capacity)
    .fetch_timeout(config.cache.fetch_timeout())
    .store(Arc::clone(store) as Arc<dyn PersistentStore>)
    .build()
}

fn status(config: &Config, store: Arc<SqliteStore>) -> Result<()> {
  let queue = offline_queue(config, Arc::clone(&store));
  let items = queue.items();

  println!("pending writes: {}", items.len());
  if let Some(oldest) = items.first() {
    println!("oldest:         {} ({})", oldest.enqueued_at, oldest.action);
  }
  let retrying = items.iter().filter(|i| i.retry_count > 0).count();
  if retrying > 0 {
    println!("retrying:       {}", retrying);
  }

  println!("cached reads:");
  for namespace in cache_namespaces(config, &store)? {
    let cache = open_cache(config, &store, &namespace);
    println!(
      "  {:<10} {:>5} entries  ttl {:?}",
      namespace,
      cache.len(),
      config.cache.ttl(&namespace)
    );
  }
  Ok(())
}

fn list(config: &Config, store: Arc<SqliteStore>) -> Result<()> {
  let queue = offline_queue(config, store);
  for item in queue.items() {
    println!(
      "{}  {:<14} retries={}  {}  {}",
      item.id, item.action, item.retry_count, item.enqueued_at, item.payload
    );
  }
  Ok(())
}

fn enqueue(config: &Config, store: Arc<SqliteStore>, action: String, payload: &str) -> Result<()> {
  let payload: serde_json::Value =
    serde_json::from_str(payload).map_err(|e| eyre!("Invalid JSON payload: {}", e))?;
  let queue = offline_queue(config, store);
  let id = queue.enqueue(action, payload);
  println!("{id}");
  Ok(())
}

async fn drain(config: &Config, store: Arc<SqliteStore>) -> Result<()> {
  let base_url = config
    .remote
    .base_url
    .as_deref()
    .ok_or_else(|| eyre!("remote.base_url is not configured"))?;
  let base_url = url::Url::parse(base_url).map_err(|e| eyre!("Invalid remote.base_url: {}", e))?;

  let mut remote = HttpRemoteStore::new(
    base_url,
    Config::api_key(),
    Duration::from_millis(config.sync.request_timeout_ms),
  )?;
  for (action, route) in &config.remote.routes {
    remote = remote.route(action.clone(), route.clone());
  }

  // Check reachability before the pass and keep checking while it runs.
  let connectivity = ConnectivityMonitor::new();
  let mut probe_task = None;
  if let Some(probe_url) = &config.connectivity.probe_url {
    let url = url::Url::parse(probe_url).map_err(|e| eyre!("Invalid probe_url: {}", e))?;
    let probe = HttpProbe::new(url, Duration::from_secs(5))?;
    connectivity.set_online(probe.check().await);
    probe_task = Some(connectivity.spawn_probe(probe, config.connectivity.probe_interval()));
  }

  let queue = SyncQueue::builder(remote.registry())
    .connectivity(connectivity)
    .options(config.sync.options())
    .store(store)
    .build();

  let report = queue.drain().await;
  if let Some(task) = probe_task {
    task.abort();
  }
  println!(
    "synced {}, failed {}, abandoned {}, remaining {}",
    report.synced, report.failed, report.abandoned, report.remaining
  );
  if report.went_offline {
    println!("remote unreachable, writes kept for later");
  }
  Ok(())
}

fn cache_clear(config: &Config, store: Arc<SqliteStore>, prefix: Option<&str>) -> Result<()> {
  let mut removed = 0;
  for namespace in cache_namespaces(config, &store)? {
    let cache = open_cache(config, &store, &namespace);
    removed += match prefix {
      Some(prefix) => cache.invalidate_prefix(prefix),
      None => {
        let n = cache.len();
        cache.clear();
        n
      }
    };
  }
  println!("removed {removed} cached reads");
  Ok(())
}
