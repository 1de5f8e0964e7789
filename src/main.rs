mod event;
mod logging;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use swcache::cache::{SqliteStorage, StoreRegistry};
use swcache::config::{self, Config};
use swcache::manifest::Manifest;
use swcache::net::{HttpNetwork, Request};
use swcache::worker::{ClientMessage, Environment, Registration, VersionDescriptor};

use event::{Event, EventHandler};

#[derive(Parser, Debug)]
#[command(name = "swcache")]
#[command(about = "Request-interception cache with versioned namespaces")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/swcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also write logs to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Precache the manifest and activate the configured version
  Install,
  /// Activate the configured version, deleting every other namespace.
  /// Installs it first when it was never precached.
  Activate,
  /// Fetch a url, or a path on the host origin, through the cache
  Fetch {
    target: String,
    /// Write the body here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
  },
  /// Refresh precached assets whose freshness token changed
  Reconcile,
  /// List cache namespaces
  Namespaces {
    /// Also list the entries of each namespace
    #[arg(short, long)]
    entries: bool,
  },
  /// Print the active version as a GET_VERSION reply
  Version,
  /// Install if needed, then reconcile periodically until Ctrl-C
  Run,
}

type Host = Registration<SqliteStorage>;

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _guard = logging::init(&config::data_dir()?.join("logs"), args.verbose)?;

  let registry = StoreRegistry::new(SqliteStorage::open(&config.database_path()?)?);
  let network = Arc::new(HttpNetwork::new(&config)?);
  let env = Environment::from_config(&config, registry.clone(), network);
  let registration = Registration::new(env, config.skip_waiting);

  let descriptor = config.version_descriptor()?;
  let manifest = Arc::new(config.manifest()?);

  match args.command {
    Command::Install => {
      let controller = registration.install(descriptor, manifest).await?;
      println!(
        "{} {}",
        controller.descriptor().static_name,
        controller.phase()
      );
    }
    Command::Activate => {
      if registration.stage(descriptor.clone(), Arc::clone(&manifest))? {
        let report = registration.activate_waiting().await?;
        println!("deleted: {}", report.deleted.join(" "));
        if !report.failed.is_empty() {
          warn!(namespaces = ?report.failed, "some namespaces could not be deleted");
        }
      } else {
        info!(version = %descriptor.version, "static namespace missing, installing");
        registration.install(descriptor.clone(), manifest).await?;
      }
      println!("{} active", descriptor.static_name);
    }
    Command::Fetch { target, output } => {
      ensure_active(&registration, descriptor, manifest).await?;
      let url = resolve_target(&config.host_origin, &target)?;
      let served = registration.fetch(&Request::get(url)).await?;

      eprintln!(
        "{} {:?} {} bytes",
        served.response.status,
        served.source,
        served.response.body.len()
      );
      match output {
        Some(path) => std::fs::write(&path, &served.response.body)?,
        None => std::io::stdout().write_all(&served.response.body)?,
      }
    }
    Command::Reconcile => {
      ensure_active(&registration, descriptor, manifest).await?;
      let report = registration.reconcile().await?;
      println!("updated:   {}", report.updated.join(" "));
      println!("unchanged: {}", report.unchanged.join(" "));
      println!("failed:    {}", report.failed.join(" "));
    }
    Command::Namespaces { entries } => {
      for name in registry.names()? {
        let current = if descriptor.owns(&name) { "*" } else { " " };
        println!("{} {}", current, name);
        if entries {
          for key in registry.keys(&name)? {
            println!("    {}", key);
          }
        }
      }
    }
    Command::Version => {
      registration.resume(descriptor, manifest)?;
      let reply = registration
        .handle_message(ClientMessage::GetVersion)
        .await?
        .ok_or_else(|| eyre!("No version is installed. Run `swcache install` first."))?;
      println!("{}", serde_json::to_string(&reply)?);
    }
    Command::Run => run(&registration, &config, descriptor, manifest).await?,
  }

  Ok(())
}

/// Resume the configured version, installing it when its namespace is missing.
async fn ensure_active(
  registration: &Host,
  descriptor: VersionDescriptor,
  manifest: Arc<Manifest>,
) -> Result<()> {
  if !registration.resume(descriptor.clone(), Arc::clone(&manifest))? {
    info!(version = %descriptor.version, "static namespace missing, installing");
    registration.install(descriptor, manifest).await?;
  }
  Ok(())
}

fn resolve_target(host_origin: &Url, target: &str) -> Result<Url> {
  match Url::parse(target) {
    Ok(url) => Ok(url),
    Err(url::ParseError::RelativeUrlWithoutBase) => host_origin
      .join(target)
      .map_err(|e| eyre!("Invalid path '{}': {}", target, e)),
    Err(e) => Err(eyre!("Invalid url '{}': {}", target, e)),
  }
}

async fn run(
  registration: &Host,
  config: &Config,
  descriptor: VersionDescriptor,
  manifest: Arc<Manifest>,
) -> Result<()> {
  let (client, core_rx) = registration.subscribers().connect();
  ensure_active(registration, descriptor, manifest).await?;

  let mut events = EventHandler::new(config.reconcile_interval(), core_rx);
  info!(interval = ?config.reconcile_interval(), "running");

  while let Some(event) = events.next().await {
    match event {
      Event::Tick => {
        if let Err(e) = registration.reconcile().await {
          warn!(error = %e, "reconciliation skipped");
        }
      }
      Event::Core(message) => println!("{}", serde_json::to_string(&message)?),
      Event::Shutdown => break,
    }
  }

  registration.subscribers().disconnect(client);
  Ok(())
}
