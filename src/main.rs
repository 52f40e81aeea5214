mod cache;
mod config;
mod net;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::Method;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use url::Url;

use cache::{
  CacheSource, CacheStorage, InterceptionPolicy, NoopStorage, PolicySettings, Request,
  SqliteStorage,
};
use config::{Config, LogConfig};
use net::HttpTransport;

#[derive(Parser, Debug)]
#[command(name = "shellcache")]
#[command(about = "Network-first offline request cache for a mini-app shell")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/shellcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Application origin, e.g. https://tasks.example.com
  #[arg(short, long)]
  origin: Option<Url>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Fetch the shell manifest into the current shell namespace
  Install,
  /// Delete namespaces that do not belong to the current version
  Activate,
  /// Run a request through the cache policy and print the body
  Get {
    /// Absolute URL, or a path relative to the origin
    target: String,
    /// HTTP method. Requests are sent without a body, so POST, PUT and PATCH are refused.
    #[arg(short = 'X', long, default_value = "GET")]
    method: String,
  },
  /// List persisted namespaces
  Namespaces,
  /// Delete a namespace and all of its entries
  Delete { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;

  // Override origin if specified on command line
  let config = if let Some(origin) = args.origin {
    Config {
      origin: Some(origin),
      ..config
    }
  } else {
    config
  };

  let _guard = init_logging(&config.log);

  match args.command {
    Command::Get { target, method } => {
      let request = build_request(&config, &target, &method)?;
      // An unusable store degrades to network-only instead of failing the request
      match open_storage(&config) {
        Ok(storage) => get(&config, Arc::new(storage), &request).await,
        Err(e) => {
          warn!(error = %e, "cache unavailable, continuing without it");
          get(&config, Arc::new(NoopStorage), &request).await
        }
      }
    }
    Command::Install => {
      let policy = build_policy(&config, Arc::new(open_storage(&config)?))?;
      let count = policy.install().await?;
      println!(
        "Cached {} shell resources in {}",
        count,
        policy.settings().shell_namespace
      );
      Ok(())
    }
    Command::Activate => {
      let policy = build_policy(&config, Arc::new(open_storage(&config)?))?;
      for name in policy.activate()? {
        println!("Deleted {}", name);
      }
      Ok(())
    }
    Command::Namespaces => {
      let storage = open_storage(&config)?;
      for name in storage.namespace_names()? {
        println!("{}\t{}", name, storage.entry_count(&name)?);
      }
      Ok(())
    }
    Command::Delete { name } => {
      let storage = open_storage(&config)?;
      if !storage.delete(&name)? {
        return Err(eyre!("No namespace named {}", name));
      }
      println!("Deleted {}", name);
      Ok(())
    }
  }
}

fn init_logging(config: &LogConfig) -> WorkerGuard {
  // stdout carries response bodies, so logs go elsewhere
  let (writer, guard) = match &config.directory {
    Some(dir) => {
      tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "shellcache.log"))
    }
    None => tracing_appender::non_blocking(std::io::stderr()),
  };

  tracing_subscriber::fmt()
    .with_writer(writer)
    .with_ansi(config.directory.is_none())
    .with_env_filter(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level)),
    )
    .init();

  guard
}

fn open_storage(config: &Config) -> Result<SqliteStorage> {
  let path = match &config.cache.database {
    Some(path) => path.clone(),
    None => SqliteStorage::default_path()?,
  };
  SqliteStorage::open(&path)
}

fn build_policy<S: CacheStorage + 'static>(
  config: &Config,
  storage: Arc<S>,
) -> Result<InterceptionPolicy<S, HttpTransport>> {
  let transport = HttpTransport::new(&config.network)?;
  let settings = PolicySettings::from_config(config)?;
  Ok(InterceptionPolicy::new(storage, transport, settings))
}

fn build_request(config: &Config, target: &str, method: &str) -> Result<Request> {
  let method = Method::from_bytes(method.to_uppercase().as_bytes())
    .map_err(|e| eyre!("Invalid method '{}': {}", method, e))?;
  if [Method::POST, Method::PUT, Method::PATCH].contains(&method) {
    return Err(eyre!(
      "{} needs a request body, which `get` cannot send",
      method
    ));
  }

  let url = match Url::parse(target) {
    Ok(url) => url,
    Err(_) => config
      .origin()?
      .join(target)
      .map_err(|e| eyre!("Invalid target '{}': {}", target, e))?,
  };

  Ok(Request::new(method, url))
}

async fn get<S: CacheStorage + 'static>(
  config: &Config,
  storage: Arc<S>,
  request: &Request,
) -> Result<()> {
  let policy = build_policy(config, storage)?;
  policy.activate()?;

  let result = policy.fetch(request).await;
  // Let write-through finish before the runtime shuts down
  policy.flush().await?;
  let interception = result?;

  info!(
    url = %request.url,
    status = interception.response.status,
    content_type = interception.response.header("content-type").unwrap_or("-"),
    source = ?interception.source,
    "response"
  );
  if interception.source == CacheSource::Synthesized {
    warn!(url = %request.url, "offline, returned placeholder payload");
  }

  std::io::stdout()
    .write_all(&interception.response.body)
    .map_err(|e| eyre!("Failed to write response body: {}", e))?;

  Ok(())
}
