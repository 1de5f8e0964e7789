//! Error types shared across the cache core.

use std::time::Duration;

use thiserror::Error;

/// Failure of a Store Registry operation.
#[derive(Debug, Error)]
pub enum StoreError {
  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),
  #[error("failed to serialize cached response: {0}")]
  Serialize(#[from] serde_json::Error),
  #[error("cache namespace {0} does not exist")]
  MissingNamespace(String),
  #[error("corrupt cache entry field: {0}")]
  Corrupt(String),
  #[error("cache storage lock poisoned")]
  LockPoisoned,
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
}

/// Failure of a network fetch.
///
/// Transport errors carry the underlying cause untouched so that callers see
/// the same failure they would without the cache in between.
#[derive(Debug, Error)]
pub enum FetchError {
  #[error(transparent)]
  Transport(Box<dyn std::error::Error + Send + Sync>),
  #[error("request to {url} timed out after {timeout:?}")]
  Timeout { url: String, timeout: Duration },
}

impl FetchError {
  pub fn transport<E>(err: E) -> Self
  where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
  {
    Self::Transport(err.into())
  }
}

/// Why a version could not be installed.
#[derive(Debug, Error)]
pub enum InstallError {
  #[error("failed to fetch manifest asset {asset}: {source}")]
  Fetch {
    asset: String,
    #[source]
    source: FetchError,
  },
  #[error("manifest asset {asset} answered with status {status}")]
  BadStatus { asset: String, status: u16 },
  #[error("manifest asset '{asset}' is not a valid url")]
  InvalidAsset { asset: String },
  #[error("failed to store precached assets: {0}")]
  Store(#[from] StoreError),
}

/// Crate-level error.
#[derive(Debug, Error)]
pub enum Error {
  #[error(transparent)]
  Store(#[from] StoreError),
  #[error(transparent)]
  Fetch(#[from] FetchError),
  #[error(transparent)]
  Install(#[from] InstallError),
  #[error("version {version} is already installing")]
  Busy { version: String },
  #[error("no controller is waiting to activate")]
  NothingWaiting,
  #[error("no version is active")]
  NoActiveController,
  #[error("configuration error: {0}")]
  Config(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
