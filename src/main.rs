mod cache;
mod config;
mod edge;
mod fetch;
mod http;
mod logging;
mod store;
mod worker;

#[cfg(test)]
mod testing;

use clap::{Parser, Subcommand, ValueEnum};
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderName, HeaderValue, USER_AGENT};
use reqwest::Method;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use cache::{CacheNames, SqliteCacheStorage};
use config::Config;
use edge::EdgeMiddleware;
use fetch::HttpFetcher;
use http::{Request, Response};
use store::{
  AppSettings, Business, ConnectivityMonitor, Document, Language, LocalStore, NoopRemote, Permit,
  SyncController, Theme,
};
use worker::{
  CacheRouter, Notification, Notifier, RouteRules, ServiceWorker, WorkerMessage, WorkerState,
};

#[derive(Parser, Debug)]
#[command(name = "permit-cache")]
#[command(about = "Offline cache, local store and edge gate for the business permit portal")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/permit-cache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Upstream origin, overrides the config file
  #[arg(short, long)]
  origin: Option<Url>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the manifest and activate the current cache generation
  Install {
    /// Stay installed without taking over from the previous generation
    #[arg(long)]
    no_activate: bool,
  },
  /// Resolve a path through the offline cache router
  Fetch {
    path: String,
    /// Treat the request as a page navigation
    #[arg(long)]
    navigate: bool,
  },
  /// Deliver a push payload (file path, or - for stdin)
  Push { payload: PathBuf },
  /// Fire the background sync event and push the local store
  Sync {
    /// Background sync tag, defaults to the configured one
    #[arg(long)]
    tag: Option<String>,
    /// Keep checking connectivity and sync on every reconnect until ctrl-c
    #[arg(long)]
    watch: bool,
  },
  /// Send one request through the edge gate and print the response
  Gate {
    path: String,
    #[arg(long, default_value = "GET")]
    method: Method,
    /// Client address, sent as x-forwarded-for
    #[arg(long)]
    ip: Option<String>,
    #[arg(long)]
    user_agent: Option<String>,
    /// Two-letter country code, sent in the configured geo header
    #[arg(long)]
    country: Option<String>,
  },
  /// Inspect and edit the local entity store
  Store {
    #[command(subcommand)]
    action: StoreAction,
  },
}

#[derive(Subcommand, Debug)]
enum StoreAction {
  /// Add a record from a JSON file
  Add {
    collection: Collection,
    file: PathBuf,
    /// Attach a file as the document payload
    #[arg(long)]
    attach: Option<PathBuf>,
  },
  /// List a collection as JSON, newest first
  List {
    collection: Collection,
    /// Only records owned by this business
    #[arg(long)]
    business: Option<i64>,
  },
  /// Show settings, applying any given changes first
  Settings {
    #[arg(long)]
    language: Option<String>,
    #[arg(long)]
    theme: Option<String>,
  },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Collection {
  Businesses,
  Documents,
  Permits,
}

/// Prints notifications to stdout so the CLI user sees them.
struct PrintNotifier;

impl Notifier for PrintNotifier {
  fn show(&self, notification: &Notification) {
    println!("{}\n{}", notification.title, notification.body);
  }
}

type Worker = ServiceWorker<SqliteCacheStorage, HttpFetcher>;

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let config = match args.origin {
    Some(origin) => Config { origin, ..config },
    None => config,
  };

  let _log_guard = logging::init(&config.logging)?;

  match args.command {
    Command::Install { no_activate } => install(&config, no_activate).await,
    Command::Fetch { path, navigate } => fetch(&config, &path, navigate).await,
    Command::Push { payload } => push(&config, &payload),
    Command::Sync { tag, watch } => sync(&config, tag.as_deref(), watch).await,
    Command::Gate {
      path,
      method,
      ip,
      user_agent,
      country,
    } => {
      let request = gate_request(&config, &path, method, ip, user_agent, country)?;
      gate(&config, &request).await
    }
    Command::Store { action } => store_command(&config, action),
  }
}

fn router(config: &Config) -> Result<CacheRouter<SqliteCacheStorage, HttpFetcher>> {
  let cache = SqliteCacheStorage::open_at(&config.cache_database()?)?;
  let network = HttpFetcher::new(config)?;

  Ok(CacheRouter::new(
    Arc::new(cache),
    Arc::new(network),
    CacheNames::versioned(&config.cache.prefix, &config.cache.version),
    RouteRules::from_config(&config.routes),
  ))
}

fn service_worker(config: &Config) -> Result<Worker> {
  let manifest = config
    .cache
    .manifest
    .iter()
    .map(|path| config.resolve(path))
    .collect::<Result<Vec<_>>>()?;

  let scope = config.resolve("/")?;
  Ok(
    ServiceWorker::new(router(config)?, scope, manifest, &config.cache.sync_tag)
      .with_skip_waiting(config.cache.skip_waiting),
  )
}

async fn install(config: &Config, no_activate: bool) -> Result<()> {
  let mut worker = service_worker(config)?;
  worker.install().await?;

  if !no_activate {
    worker.handle_message(WorkerMessage::SkipWaiting)?;
  }

  println!("state: {:?}", worker.state());
  println!("controls clients: {}", worker.controls_clients());
  println!("caches: {}", worker.router().names().all().join(", "));
  if worker.state() == WorkerState::Installed {
    println!("waiting: run install again without --no-activate to take over");
  }
  Ok(())
}

async fn fetch(config: &Config, path: &str, navigate: bool) -> Result<()> {
  let url = config.resolve(path)?;
  let request = if navigate {
    Request::navigate(url)
  } else {
    Request::get(url)
  };

  let handled = service_worker(config)?
    .handle_fetch(&request)
    .await
    .ok_or_else(|| eyre!("Request was not intercepted"))?;

  eprintln!(
    "{} {} ({}, {})",
    handled.response.status,
    request.url,
    handled.kind.as_str(),
    handled.source.as_str()
  );
  write_body(&handled.response)?;

  // The process would otherwise exit before the refreshed copy is stored.
  if let Some(revalidation) = handled.revalidation {
    match revalidation.await {
      Ok(Ok(fresh)) => tracing::debug!(status = %fresh.status, "revalidated"),
      Ok(Err(e)) => tracing::warn!(error = %e, "revalidation failed"),
      Err(e) => tracing::warn!(error = %e, "revalidation task panicked"),
    }
  }
  Ok(())
}

fn push(config: &Config, payload: &Path) -> Result<()> {
  let bytes = if payload == Path::new("-") {
    let mut buf = Vec::new();
    std::io::stdin()
      .read_to_end(&mut buf)
      .map_err(|e| eyre!("Failed to read payload from stdin: {}", e))?;
    buf
  } else {
    std::fs::read(payload)
      .map_err(|e| eyre!("Failed to read payload {}: {}", payload.display(), e))?
  };

  let worker = service_worker(config)?.with_notifier(Arc::new(PrintNotifier));
  match worker.handle_push(Some(bytes.as_slice())) {
    Some(notification) => {
      let target = worker.handle_notification_click(&notification)?;
      println!("opens: {}", target);
    }
    None => eprintln!("payload ignored"),
  }
  Ok(())
}

async fn sync(config: &Config, tag: Option<&str>, watch: bool) -> Result<()> {
  let store = Arc::new(LocalStore::open(config)?);
  let network = Arc::new(HttpFetcher::new(config)?);

  let monitor = Arc::new(ConnectivityMonitor::new(false));
  let probe = config.resolve(config.store.probe_path.as_deref().unwrap_or("/"))?;
  let online = monitor.probe(network.as_ref(), &probe).await;

  let controller = Arc::new(SyncController::new(store.clone(), NoopRemote, monitor.handle()));
  let worker = service_worker(config)?.with_replay(controller.clone());

  let tag = tag.unwrap_or(&config.cache.sync_tag);
  if !worker.handle_sync(tag).await {
    return Err(eyre!("Unknown sync tag: {}", tag));
  }

  println!("online: {}", online);
  println!("status: {}", controller.status().as_str());
  match store.settings()?.last_sync {
    Some(at) => println!("last sync: {}", at.to_rfc3339()),
    None => println!("last sync: never"),
  }

  if watch {
    let every = Duration::from_secs(config.store.probe_interval_secs.max(1));
    watch_connectivity(monitor, network, probe, controller, every).await?;
  }
  Ok(())
}

/// Re-check connectivity on an interval and sync on every reconnect,
/// printing each transition, until interrupted.
async fn watch_connectivity(
  monitor: Arc<ConnectivityMonitor>,
  network: Arc<HttpFetcher>,
  probe: Url,
  controller: Arc<SyncController<NoopRemote>>,
  every: Duration,
) -> Result<()> {
  let mut connectivity = monitor.handle();
  let mut status = controller.subscribe();
  let checks = monitor.clone().spawn_probe(network, probe, every);
  let resync = controller.clone().spawn_on_reconnect();
  eprintln!("watching every {}s, ctrl-c to stop", every.as_secs());

  let interrupted = loop {
    tokio::select! {
      signal = tokio::signal::ctrl_c() => break signal,
      Ok(online) = connectivity.changed() => println!("online: {}", online),
      Ok(()) = status.changed() => {
        println!("status: {}", status.borrow_and_update().as_str());
      }
    }
  };

  checks.abort();
  resync.abort();
  interrupted.map_err(|e| eyre!("Failed to listen for ctrl-c: {}", e))
}

fn gate_request(
  config: &Config,
  path: &str,
  method: Method,
  ip: Option<String>,
  user_agent: Option<String>,
  country: Option<String>,
) -> Result<Request> {
  let mut request = Request::new(method, config.resolve(path)?);

  let geo_header = HeaderName::from_bytes(config.edge.country_header.as_bytes())
    .map_err(|e| eyre!("Invalid country header name: {}", e))?;
  let headers = [
    (HeaderName::from_static("x-forwarded-for"), ip),
    (USER_AGENT, user_agent),
    (geo_header, country),
  ];

  for (name, value) in headers {
    if let Some(value) = value {
      let value = HeaderValue::from_str(&value)
        .map_err(|e| eyre!("Invalid value for {}: {}", name, e))?;
      request = request.with_header(name, value);
    }
  }
  Ok(request)
}

async fn gate(config: &Config, request: &Request) -> Result<()> {
  let upstream = Arc::new(HttpFetcher::new(config)?);
  let edge = EdgeMiddleware::from_config(&config.edge, &config.routes, upstream)?;

  let response = edge.handle(request).await;
  eprintln!("{}", response.status);
  for (name, value) in &response.headers {
    eprintln!("{}: {}", name, value.to_str().unwrap_or("<binary>"));
  }
  write_body(&response)
}

fn store_command(config: &Config, action: StoreAction) -> Result<()> {
  let store = LocalStore::open(config)?;

  match action {
    StoreAction::Add {
      collection,
      file,
      attach,
    } => {
      let contents = std::fs::read_to_string(&file)
        .map_err(|e| eyre!("Failed to read {}: {}", file.display(), e))?;

      let id = match collection {
        Collection::Businesses => store.add_business(&parse_record::<Business>(&contents)?)?,
        Collection::Permits => store.add_permit(&parse_record::<Permit>(&contents)?)?,
        Collection::Documents => {
          let mut document: Document = parse_record(&contents)?;
          if let Some(path) = attach {
            document.data = std::fs::read(&path)
              .map_err(|e| eyre!("Failed to read attachment {}: {}", path.display(), e))?;
            document.size = document.data.len() as u64;
          }
          store.add_document(&document)?
        }
      };
      println!("{}", id);
    }
    StoreAction::List {
      collection,
      business,
    } => {
      let json = match (collection, business) {
        (Collection::Businesses, _) => to_json(&store.businesses()?)?,
        (Collection::Documents, None) => to_json(&store.documents()?)?,
        (Collection::Documents, Some(id)) => to_json(&store.documents_for_business(id)?)?,
        (Collection::Permits, None) => to_json(&store.permits()?)?,
        (Collection::Permits, Some(id)) => to_json(&store.permits_for_business(id)?)?,
      };
      println!("{}", json);
    }
    StoreAction::Settings { language, theme } => {
      if language.is_some() || theme.is_some() {
        let current = store.settings()?;
        let updated = AppSettings {
          language: language
            .as_deref()
            .map(str::parse::<Language>)
            .transpose()?
            .unwrap_or(current.language),
          theme: theme
            .as_deref()
            .map(str::parse::<Theme>)
            .transpose()?
            .unwrap_or(current.theme),
          ..current
        };
        store.update_settings(&updated)?;
      }
      println!("{}", to_json(&store.settings()?)?);
    }
  }
  Ok(())
}

fn parse_record<T: serde::de::DeserializeOwned>(contents: &str) -> Result<T> {
  serde_json::from_str(contents).map_err(|e| eyre!("Invalid record: {}", e))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
  serde_json::to_string_pretty(value).map_err(|e| eyre!("Failed to encode JSON: {}", e))
}

fn write_body(response: &Response) -> Result<()> {
  let mut stdout = std::io::stdout().lock();
  stdout
    .write_all(&response.body)
    .and_then(|_| stdout.flush())
    .map_err(|e| eyre!("Failed to write response body: {}", e))
}
