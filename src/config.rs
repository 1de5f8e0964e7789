use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::worker::VersionDescriptor;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Origin the cached application is served from
  pub host_origin: Url,
  pub version: VersionConfig,
  #[serde(default)]
  pub manifest: ManifestConfig,
  #[serde(default)]
  pub bypass: BypassConfig,
  #[serde(default = "default_fetch_timeout_secs")]
  pub fetch_timeout_secs: u64,
  #[serde(default = "default_reconcile_interval_secs")]
  pub reconcile_interval_secs: u64,
  /// Promote a freshly installed version without waiting for SKIP_WAITING
  #[serde(default = "default_skip_waiting")]
  pub skip_waiting: bool,
  /// SQLite database path (defaults to $XDG_DATA_HOME/swcache/cache.db)
  pub database: Option<PathBuf>,
  #[serde(default = "default_user_agent")]
  pub user_agent: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VersionConfig {
  pub version: String,
  /// Namespace name prefix, e.g. "logo-package-generator"
  pub prefix: Option<String>,
  /// Explicit static namespace name, overrides the prefix scheme
  pub static_name: Option<String>,
  /// Explicit dynamic namespace name, overrides the prefix scheme
  pub dynamic_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ManifestConfig {
  /// First-party assets, paths are resolved against host_origin
  #[serde(default)]
  pub assets: Vec<String>,
  /// Third-party urls that may be precached and stored at runtime
  #[serde(default)]
  pub third_party: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BypassConfig {
  /// Url schemes of local browser extensions (case-insensitive)
  #[serde(default = "default_bypass_schemes", deserialize_with = "deserialize_lowercase_set")]
  pub schemes: BTreeSet<String>,
  /// Live-API origins that always go to the network
  #[serde(default, deserialize_with = "deserialize_origin_set")]
  pub live_origins: BTreeSet<String>,
}

impl Default for BypassConfig {
  fn default() -> Self {
    Self {
      schemes: default_bypass_schemes(),
      live_origins: BTreeSet::new(),
    }
  }
}

fn default_fetch_timeout_secs() -> u64 {
  30
}

fn default_reconcile_interval_secs() -> u64 {
  60 * 60
}

fn default_skip_waiting() -> bool {
  true
}

fn default_user_agent() -> String {
  format!("swcache/{}", env!("CARGO_PKG_VERSION"))
}

fn default_bypass_schemes() -> BTreeSet<String> {
  ["chrome-extension", "moz-extension", "safari-web-extension"]
    .into_iter()
    .map(String::from)
    .collect()
}

fn deserialize_lowercase_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  Ok(v.into_iter().map(|s| s.to_lowercase()).collect())
}

fn deserialize_origin_set<'de, D>(deserializer: D) -> Result<BTreeSet<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  v.into_iter()
    .map(|s| {
      Url::parse(&s)
        .map(|u| u.origin().ascii_serialization())
        .map_err(|e| serde::de::Error::custom(format!("invalid origin '{}': {}", s, e)))
    })
    .collect()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./swcache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/swcache/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(Error::Config(format!(
          "Config file not found: {}",
          p.display()
        )));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(Error::Config(
        "No configuration file found. Create one at ~/.config/swcache/config.yaml".to_string(),
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("swcache.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("swcache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
      Error::Config(format!(
        "Failed to read config file {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::from_yaml(&contents)
      .map_err(|e| Error::Config(format!("{} ({})", e, path.display())))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    serde_yaml::from_str(contents)
      .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
  }

  /// Namespace names of the configured version.
  pub fn version_descriptor(&self) -> Result<VersionDescriptor> {
    let v = &self.version;
    match (&v.static_name, &v.dynamic_name, &v.prefix) {
      (Some(s), Some(d), _) => Ok(VersionDescriptor::with_names(&v.version, s, d)),
      (None, None, Some(prefix)) => Ok(VersionDescriptor::new(prefix, &v.version)),
      _ => Err(Error::Config(
        "version needs either a prefix or both static_name and dynamic_name".to_string(),
      )),
    }
  }

  pub fn manifest(&self) -> Result<Manifest> {
    Ok(Manifest::resolve(
      &self.host_origin,
      &self.manifest.assets,
      &self.manifest.third_party,
    )?)
  }

  pub fn fetch_timeout(&self) -> Duration {
    Duration::from_secs(self.fetch_timeout_secs)
  }

  pub fn reconcile_interval(&self) -> Duration {
    Duration::from_secs(self.reconcile_interval_secs)
  }

  /// Database path, falling back to the platform data directory.
  pub fn database_path(&self) -> Result<PathBuf> {
    if let Some(path) = &self.database {
      return Ok(path.clone());
    }
    Ok(data_dir()?.join("cache.db"))
  }
}

/// Directory for the database and log files.
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| Error::Config("Could not determine data directory".to_string()))?;

  Ok(data_dir.join("swcache"))
}
