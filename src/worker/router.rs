//! Cache-first interception of outgoing requests.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use reqwest::Method;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheStorage, NamespaceHandle, NamespaceRole, RequestKey};
use crate::error::{FetchError, StoreError};
use crate::manifest::Manifest;
use crate::net::{fetch_with_timeout, Request, Response, ResponseKind};

use super::lifecycle::Environment;
use super::version::VersionDescriptor;

/// Which requests are left alone and which origin is "ours".
#[derive(Debug, Clone)]
pub struct RoutePolicy {
  host_origin: String,
  extension_schemes: BTreeSet<String>,
  live_origins: BTreeSet<String>,
}

/// Why a request was not intercepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BypassReason {
  /// Not a plain retrieval
  Method,
  /// Local browser extension resource
  Extension,
  /// Live API, always network and never cached
  LiveApi,
  /// The version is not active, e.g. superseded by a newer one
  Inactive,
}

impl RoutePolicy {
  pub fn new<I, J>(host_origin: Url, extension_schemes: I, live_origins: J) -> Self
  where
    I: IntoIterator<Item = String>,
    J: IntoIterator<Item = String>,
  {
    Self {
      host_origin: host_origin.origin().ascii_serialization(),
      extension_schemes: extension_schemes.into_iter().collect(),
      live_origins: live_origins.into_iter().collect(),
    }
  }

  pub fn bypass_reason(&self, request: &Request) -> Option<BypassReason> {
    if request.method != Method::GET {
      Some(BypassReason::Method)
    } else if self.extension_schemes.contains(request.url.scheme()) {
      Some(BypassReason::Extension)
    } else if self.live_origins.contains(&request.origin()) {
      Some(BypassReason::LiveApi)
    } else {
      None
    }
  }

  pub fn is_host_origin(&self, request: &Request) -> bool {
    request.origin() == self.host_origin
  }
}

/// Where a served response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
  Cache,
  Network,
  /// Not intercepted, fetched directly
  Passthrough,
}

#[derive(Debug, Clone)]
pub struct Served {
  pub response: Response,
  pub source: Source,
}

/// Result of offering a request to the router.
#[derive(Debug, Clone)]
pub enum Intercepted {
  /// Leave the request to the host untouched
  Bypass(BypassReason),
  Served(Served),
}

/// What happened to the copy of a network response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
  Stored,
  SkippedNotOk,
  SkippedOpaque,
  SkippedNotAllowed,
  /// The dynamic namespace is gone, as after the version was superseded
  SkippedNoNamespace,
  Failed,
}

/// Counters for the router's cache traffic.
#[derive(Debug, Default)]
pub struct RouterStats {
  hits: AtomicU64,
  misses: AtomicU64,
  bypassed: AtomicU64,
  stored: AtomicU64,
  skipped: AtomicU64,
  write_failures: AtomicU64,
  read_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
  pub hits: u64,
  pub misses: u64,
  pub bypassed: u64,
  pub stored: u64,
  pub skipped: u64,
  pub write_failures: u64,
  pub read_failures: u64,
}

impl RouterStats {
  fn record_write(&self, outcome: WriteOutcome) {
    let counter = match outcome {
      WriteOutcome::Stored => &self.stored,
      WriteOutcome::Failed => &self.write_failures,
      _ => &self.skipped,
    };
    counter.fetch_add(1, Ordering::Relaxed);
  }

  pub fn snapshot(&self) -> StatsSnapshot {
    StatsSnapshot {
      hits: self.hits.load(Ordering::Relaxed),
      misses: self.misses.load(Ordering::Relaxed),
      bypassed: self.bypassed.load(Ordering::Relaxed),
      stored: self.stored.load(Ordering::Relaxed),
      skipped: self.skipped.load(Ordering::Relaxed),
      write_failures: self.write_failures.load(Ordering::Relaxed),
      read_failures: self.read_failures.load(Ordering::Relaxed),
    }
  }
}

/// Routes requests for one version's namespaces.
///
/// Safe to call concurrently: the only shared mutable state is the store and
/// the atomic counters.
pub struct Router<S: CacheStorage> {
  env: Environment<S>,
  manifest: Arc<Manifest>,
  search_order: [String; 2],
  dynamic: NamespaceHandle,
  stats: RouterStats,
}

impl<S: CacheStorage> Router<S> {
  pub fn new(env: Environment<S>, descriptor: &VersionDescriptor, manifest: Arc<Manifest>) -> Self {
    Self {
      env,
      manifest,
      search_order: [
        descriptor.name(NamespaceRole::Static).to_string(),
        descriptor.name(NamespaceRole::Dynamic).to_string(),
      ],
      dynamic: NamespaceHandle::existing(descriptor.name(NamespaceRole::Dynamic)),
      stats: RouterStats::default(),
    }
  }

  pub fn stats(&self) -> StatsSnapshot {
    self.stats.snapshot()
  }

  /// Serve from cache, else from network, storing the copy when allowed.
  ///
  /// Network failures on a miss reach the caller unchanged.
  pub async fn handle(&self, request: &Request) -> Result<Intercepted, FetchError> {
    if let Some(reason) = self.env.policy.bypass_reason(request) {
      debug!(url = %request.url, ?reason, "bypassing");
      self.stats.bypassed.fetch_add(1, Ordering::Relaxed);
      return Ok(Intercepted::Bypass(reason));
    }

    let key = RequestKey::from_request(request);
    match self.env.registry.match_any(&self.search_order, &key) {
      Ok(Some(response)) => {
        debug!(%key, "cache hit");
        self.stats.hits.fetch_add(1, Ordering::Relaxed);
        return Ok(Intercepted::Served(Served {
          response,
          source: Source::Cache,
        }));
      }
      Ok(None) => {
        debug!(%key, "cache miss");
      }
      Err(e) => {
        warn!(%key, error = %e, "cache lookup failed, using network");
        self.stats.read_failures.fetch_add(1, Ordering::Relaxed);
      }
    }
    self.stats.misses.fetch_add(1, Ordering::Relaxed);

    let response =
      fetch_with_timeout(self.env.network.as_ref(), request, self.env.fetch_timeout).await?;

    let outcome = self.store_copy(request, &key, &response);
    self.stats.record_write(outcome);

    Ok(Intercepted::Served(Served {
      response,
      source: Source::Network,
    }))
  }

  /// Store a duplicate of a successful response into the dynamic namespace.
  /// Never fails the caller and never recreates a deleted namespace.
  fn store_copy(&self, request: &Request, key: &RequestKey, response: &Response) -> WriteOutcome {
    if !response.is_ok() {
      debug!(%key, status = response.status, "not caching non-ok response");
      return WriteOutcome::SkippedNotOk;
    }
    if response.kind == ResponseKind::Opaque {
      debug!(%key, "not caching opaque response");
      return WriteOutcome::SkippedOpaque;
    }

    let allowed = self.env.policy.is_host_origin(request)
      || self.manifest.is_third_party_allowed(&request.url)
      || self.manifest.is_first_party(&request.url);
    if !allowed {
      debug!(%key, "origin not allowed for runtime caching");
      return WriteOutcome::SkippedNotAllowed;
    }

    let copy = response.clone();
    match self.env.registry.put(&self.dynamic, key, &copy) {
      Ok(()) => {
        debug!(%key, namespace = %self.dynamic.name, "stored runtime response");
        WriteOutcome::Stored
      }
      Err(StoreError::MissingNamespace(namespace)) => {
        debug!(%key, %namespace, "dynamic namespace gone, not caching");
        WriteOutcome::SkippedNoNamespace
      }
      Err(e) => {
        warn!(%key, error = %e, "failed to store runtime response");
        WriteOutcome::Failed
      }
    }
  }
}
