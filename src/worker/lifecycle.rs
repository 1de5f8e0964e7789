//! Install / activate state machine for one version.

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::try_join_all;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheStorage, NamespaceHandle, RequestKey, StoreRegistry};
use crate::config::Config;
use crate::error::{FetchError, InstallError, StoreError};
use crate::manifest::{Manifest, ManifestEntry};
use crate::net::{fetch_with_timeout, Network, Request, Response};

use super::bridge::SubscriberRegistry;
use super::reconciler::{ReconcileReport, Reconciler};
use super::router::{BypassReason, Intercepted, RoutePolicy, Router, StatsSnapshot};
use super::version::VersionDescriptor;

/// Host-provided collaborators shared by every version.
pub struct Environment<S: CacheStorage> {
  pub registry: StoreRegistry<S>,
  pub network: Arc<dyn Network>,
  pub subscribers: Arc<SubscriberRegistry>,
  pub policy: Arc<RoutePolicy>,
  /// Upper bound for every network fetch
  pub fetch_timeout: Duration,
}

impl<S: CacheStorage> Environment<S> {
  pub fn from_config(config: &Config, registry: StoreRegistry<S>, network: Arc<dyn Network>) -> Self {
    Self {
      registry,
      network,
      subscribers: Arc::new(SubscriberRegistry::new()),
      policy: Arc::new(RoutePolicy::new(
        config.host_origin.clone(),
        config.bypass.schemes.iter().cloned(),
        config.bypass.live_origins.iter().cloned(),
      )),
      fetch_timeout: config.fetch_timeout(),
    }
  }
}

impl<S: CacheStorage> Clone for Environment<S> {
  fn clone(&self) -> Self {
    Self {
      registry: self.registry.clone(),
      network: Arc::clone(&self.network),
      subscribers: Arc::clone(&self.subscribers),
      policy: Arc::clone(&self.policy),
      fetch_timeout: self.fetch_timeout,
    }
  }
}

/// Lifecycle phase of a controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Phase {
  Installing,
  /// Installed, waiting to supersede the active version
  Installed,
  Activating,
  Active,
  /// Superseded by a newer version
  Redundant,
  /// Precaching failed; this version never routes
  Failed(String),
}

impl fmt::Display for Phase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Phase::Installing => write!(f, "installing"),
      Phase::Installed => write!(f, "installed"),
      Phase::Activating => write!(f, "activating"),
      Phase::Active => write!(f, "active"),
      Phase::Redundant => write!(f, "redundant"),
      Phase::Failed(reason) => write!(f, "failed: {}", reason),
    }
  }
}

/// Result of the activation cleanup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
  pub deleted: Vec<String>,
  /// Namespaces that could not be deleted and were left behind
  pub failed: Vec<String>,
  pub claimed: usize,
}

/// Controller of one version: its namespaces, router and reconciler.
pub struct Controller<S: CacheStorage> {
  env: Environment<S>,
  descriptor: VersionDescriptor,
  manifest: Arc<Manifest>,
  router: Router<S>,
  reconciler: Reconciler<S>,
  phase: Mutex<Phase>,
}

impl<S: CacheStorage> Controller<S> {
  pub fn new(env: Environment<S>, descriptor: VersionDescriptor, manifest: Arc<Manifest>) -> Self {
    let router = Router::new(env.clone(), &descriptor, Arc::clone(&manifest));
    let reconciler = Reconciler::new(env.clone(), &descriptor.static_name, Arc::clone(&manifest));
    Self {
      env,
      descriptor,
      manifest,
      router,
      reconciler,
      phase: Mutex::new(Phase::Installing),
    }
  }

  pub fn is_active(&self) -> bool {
    self.phase() == Phase::Active
  }

  pub fn descriptor(&self) -> &VersionDescriptor {
    &self.descriptor
  }

  pub fn phase(&self) -> Phase {
    self.phase.lock().unwrap_or_else(|e| e.into_inner()).clone()
  }

  fn set_phase(&self, phase: Phase) {
    info!(version = %self.descriptor.version, %phase, "lifecycle transition");
    *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
  }

  pub fn stats(&self) -> StatsSnapshot {
    self.router.stats()
  }

  /// Precache every manifest entry into the static namespace.
  ///
  /// All or nothing: one failed asset fails the whole install and nothing is
  /// stored.
  pub async fn on_install(&self) -> Result<(), InstallError> {
    self.set_phase(Phase::Installing);

    let handle = match self.env.registry.open(&self.descriptor.static_name) {
      Ok(handle) => handle,
      Err(e) => return Err(self.fail(e.into())),
    };

    match self.precache(&handle).await {
      Ok(count) => {
        info!(version = %self.descriptor.version, assets = count, "precached manifest");
        self.set_phase(Phase::Installed);
        Ok(())
      }
      Err(e) => {
        // Never leave a half-filled namespace behind for a new version
        if handle.created {
          if let Err(cleanup) = self.env.registry.delete(&handle.name) {
            warn!(namespace = %handle.name, error = %cleanup, "failed to remove partial namespace");
          }
        }
        Err(self.fail(e))
      }
    }
  }

  fn fail(&self, e: InstallError) -> InstallError {
    error!(version = %self.descriptor.version, error = %e, "install failed");
    self.set_phase(Phase::Failed(e.to_string()));
    e
  }

  async fn precache(&self, handle: &NamespaceHandle) -> Result<usize, InstallError> {
    let fetched = try_join_all(self.manifest.entries().map(|entry| self.fetch_asset(entry))).await?;

    for (key, response) in &fetched {
      self.env.registry.put(handle, key, response)?;
    }
    Ok(fetched.len())
  }

  async fn fetch_asset(&self, entry: &ManifestEntry) -> Result<(RequestKey, Response), InstallError> {
    let request = Request::get(entry.url.clone());
    let response = fetch_with_timeout(self.env.network.as_ref(), &request, self.env.fetch_timeout)
      .await
      .map_err(|source| InstallError::Fetch {
        asset: entry.id.clone(),
        source,
      })?;

    if !response.is_ok() {
      return Err(InstallError::BadStatus {
        asset: entry.id.clone(),
        status: response.status,
      });
    }
    Ok((RequestKey::from_request(&request), response))
  }

  /// Delete every namespace this version does not own, then claim all
  /// connected clients. Delete failures are logged and skipped.
  pub async fn on_activate(&self) -> ActivationReport {
    self.set_phase(Phase::Activating);
    let mut report = ActivationReport::default();

    let names = self.env.registry.names().unwrap_or_else(|e| {
      warn!(error = %e, "cannot enumerate namespaces, skipping cleanup");
      Vec::new()
    });

    for name in names.into_iter().filter(|n| !self.descriptor.owns(n)) {
      match self.env.registry.delete(&name) {
        Ok(_) => {
          info!(namespace = %name, "deleted stale namespace");
          report.deleted.push(name);
        }
        Err(e) => {
          warn!(namespace = %name, error = %e, "failed to delete stale namespace");
          report.failed.push(name);
        }
      }
    }

    if let Err(e) = self.env.registry.open(&self.descriptor.dynamic_name) {
      warn!(namespace = %self.descriptor.dynamic_name, error = %e, "cannot open dynamic namespace");
    }

    report.claimed = self.env.subscribers.claim(&self.descriptor.version);
    self.set_phase(Phase::Active);
    report
  }

  /// Restore a version whose static namespace already exists, as after a
  /// host restart. Skips install and cleanup.
  pub(crate) fn resume(&self) -> Result<(), StoreError> {
    self.env.registry.open(&self.descriptor.dynamic_name)?;
    self.set_phase(Phase::Active);
    Ok(())
  }

  /// Take a version whose static namespace already exists as installed,
  /// without refetching its manifest.
  pub(crate) fn adopt(&self) {
    self.set_phase(Phase::Installed);
  }

  pub(crate) fn retire(&self) {
    self.set_phase(Phase::Redundant);
  }

  /// Route a request. Only an active controller intercepts; any other phase
  /// leaves the request to the host.
  pub async fn on_intercept(&self, request: &Request) -> Result<Intercepted, FetchError> {
    if !self.is_active() {
      debug!(version = %self.descriptor.version, url = %request.url, "not active, bypassing");
      return Ok(Intercepted::Bypass(BypassReason::Inactive));
    }
    self.router.handle(request).await
  }

  /// Refresh precached assets. Does nothing unless this controller is active.
  pub async fn on_reconcile(&self) -> ReconcileReport {
    if !self.is_active() {
      debug!(version = %self.descriptor.version, phase = %self.phase(), "not active, skipping reconciliation");
      return ReconcileReport::default();
    }
    self.reconciler.run().await
  }
}

impl<S: CacheStorage> fmt::Debug for Controller<S> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Controller")
      .field("descriptor", &self.descriptor)
      .field("phase", &self.phase())
      .finish_non_exhaustive()
  }
}
