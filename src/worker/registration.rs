//! Supersession of versions: one active controller, at most one waiting.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use crate::cache::CacheStorage;
use crate::error::{Error, Result};
use crate::manifest::Manifest;
use crate::net::{fetch_with_timeout, Request};

use super::bridge::{ClientMessage, SubscriberRegistry};
use super::lifecycle::{ActivationReport, Controller, Environment};
use super::reconciler::ReconcileReport;
use super::router::{Intercepted, Served, Source};
use super::version::{VersionDescriptor, VersionInfo};

struct Slots<S: CacheStorage> {
  /// Version currently precaching
  installing: Option<String>,
  waiting: Option<Arc<Controller<S>>>,
  active: Option<Arc<Controller<S>>>,
}

/// Owner of the active and waiting controllers.
pub struct Registration<S: CacheStorage> {
  env: Environment<S>,
  skip_waiting: bool,
  slots: Mutex<Slots<S>>,
}

/// Clears the installing slot even if the install future is dropped.
struct InstallGuard<'a, S: CacheStorage> {
  registration: &'a Registration<S>,
}

impl<S: CacheStorage> Drop for InstallGuard<'_, S> {
  fn drop(&mut self) {
    self.registration.slots().installing = None;
  }
}

impl<S: CacheStorage> Registration<S> {
  pub fn new(env: Environment<S>, skip_waiting: bool) -> Self {
    Self {
      env,
      skip_waiting,
      slots: Mutex::new(Slots {
        installing: None,
        waiting: None,
        active: None,
      }),
    }
  }

  fn slots(&self) -> MutexGuard<'_, Slots<S>> {
    self.slots.lock().unwrap_or_else(|e| e.into_inner())
  }

  pub fn subscribers(&self) -> &Arc<SubscriberRegistry> {
    &self.env.subscribers
  }

  pub fn active(&self) -> Option<Arc<Controller<S>>> {
    self.slots().active.clone()
  }

  pub fn waiting(&self) -> Option<Arc<Controller<S>>> {
    self.slots().waiting.clone()
  }

  /// Install a version. Only one install may run at a time; a second one is
  /// rejected with [`Error::Busy`].
  ///
  /// On success the version waits, unless skip-waiting is configured or no
  /// version is active yet, in which case it is activated at once.
  pub async fn install(
    &self,
    descriptor: VersionDescriptor,
    manifest: Arc<Manifest>,
  ) -> Result<Arc<Controller<S>>> {
    let guard = {
      let mut slots = self.slots();
      if let Some(version) = &slots.installing {
        return Err(Error::Busy {
          version: version.clone(),
        });
      }
      slots.installing = Some(descriptor.version.clone());
      InstallGuard { registration: self }
    };

    let controller = Arc::new(Controller::new(self.env.clone(), descriptor, manifest));
    let result = controller.on_install().await;
    drop(guard);
    result?;

    let promote = {
      let mut slots = self.slots();
      if let Some(previous) = slots.waiting.replace(Arc::clone(&controller)) {
        previous.retire();
      }
      self.skip_waiting || slots.active.is_none()
    };

    if promote {
      self.activate_waiting().await?;
    } else {
      info!(version = %controller.descriptor().version, "installed, waiting to activate");
    }
    Ok(controller)
  }

  /// Promote the waiting version to active and run its cleanup.
  ///
  /// The previous version keeps routing until cleanup is done and is retired
  /// only then. Its writes into the deleted namespaces fail rather than
  /// recreate them.
  pub async fn activate_waiting(&self) -> Result<ActivationReport> {
    let controller = self.slots().waiting.take().ok_or(Error::NothingWaiting)?;

    let report = controller.on_activate().await;
    if let Some(previous) = self.slots().active.replace(Arc::clone(&controller)) {
      previous.retire();
    }
    info!(
      version = %controller.descriptor().version,
      deleted = ?report.deleted,
      claimed = report.claimed,
      "activated"
    );
    Ok(report)
  }

  /// Adopt a version whose static namespace already exists as the active one.
  /// Returns false when the namespace is missing and an install is needed.
  pub fn resume(&self, descriptor: VersionDescriptor, manifest: Arc<Manifest>) -> Result<bool> {
    if !self.env.registry.contains(&descriptor.static_name)? {
      return Ok(false);
    }

    let controller = Arc::new(Controller::new(self.env.clone(), descriptor, manifest));
    controller.resume()?;
    let mut slots = self.slots();
    if let Some(previous) = slots.active.replace(controller) {
      previous.retire();
    }
    Ok(true)
  }

  /// Stage an already precached version as the waiting one, so that
  /// [`Registration::activate_waiting`] runs its cleanup. Returns false when
  /// the static namespace is missing and an install is needed.
  pub fn stage(&self, descriptor: VersionDescriptor, manifest: Arc<Manifest>) -> Result<bool> {
    if !self.env.registry.contains(&descriptor.static_name)? {
      return Ok(false);
    }

    let controller = Arc::new(Controller::new(self.env.clone(), descriptor, manifest));
    controller.adopt();
    if let Some(previous) = self.slots().waiting.replace(controller) {
      previous.retire();
    }
    Ok(true)
  }

  /// Serve a request through the active version, or straight from the
  /// network when nothing is active or the request is not intercepted.
  pub async fn fetch(&self, request: &Request) -> Result<Served> {
    if let Some(active) = self.active() {
      match active.on_intercept(request).await? {
        Intercepted::Served(served) => return Ok(served),
        Intercepted::Bypass(reason) => {
          debug!(url = %request.url, ?reason, "passing through");
        }
      }
    }

    let response =
      fetch_with_timeout(self.env.network.as_ref(), request, self.env.fetch_timeout).await?;
    Ok(Served {
      response,
      source: Source::Passthrough,
    })
  }

  /// Run a reconciliation pass for the active version.
  pub async fn reconcile(&self) -> Result<ReconcileReport> {
    let active = self.active().ok_or(Error::NoActiveController)?;
    Ok(active.on_reconcile().await)
  }

  /// Handle a message from a client. `GET_VERSION` yields a reply.
  pub async fn handle_message(&self, message: ClientMessage) -> Result<Option<VersionInfo>> {
    match message {
      ClientMessage::GetVersion => {
        let slots = self.slots();
        Ok(
          slots
            .active
            .as_ref()
            .or(slots.waiting.as_ref())
            .map(|c| c.descriptor().info()),
        )
      }
      ClientMessage::SkipWaiting => match self.activate_waiting().await {
        Ok(_) => Ok(None),
        Err(Error::NothingWaiting) => {
          debug!("skip waiting requested with nothing waiting");
          Ok(None)
        }
        Err(e) => Err(e),
      },
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use crate::net::Response;
  use crate::test_utils::{environment, get, key, manifest, url, FakeNetwork};
  use crate::worker::Phase;

  fn v(version: &str) -> VersionDescriptor {
    VersionDescriptor::new("logo-package-generator", version)
  }

  #[tokio::test]
  async fn test_first_install_activates() {
    let network = FakeNetwork::new();
    network.respond(&url("/"), Response::new(200, "index"));
    let registration = Registration::new(environment(MemoryStorage::new(), network.clone()), false);

    let controller = registration.install(v("1.0.0"), manifest(&["/"], &[])).await.unwrap();

    assert_eq!(controller.phase(), Phase::Active);
    let served = registration.fetch(&get(&url("/"))).await.unwrap();
    assert_eq!(served.source, Source::Cache);
    assert_eq!(network.call_count(), 1);
  }

  #[tokio::test]
  async fn test_new_version_waits_until_skip_waiting() {
    let network = FakeNetwork::new();
    network.respond(&url("/"), Response::new(200, "index"));
    let env = environment(MemoryStorage::new(), network.clone());
    let registry = env.registry.clone();
    let registration = Registration::new(env, false);

    let v1 = registration.install(v("1.0.0"), manifest(&["/"], &[])).await.unwrap();
    let v2 = registration.install(v("2.0.0"), manifest(&["/"], &[])).await.unwrap();

    assert_eq!(v2.phase(), Phase::Installed);
    let info = registration.handle_message(ClientMessage::GetVersion).await.unwrap();
    assert_eq!(info.unwrap().version, "1.0.0");

    registration.handle_message(ClientMessage::SkipWaiting).await.unwrap();

    assert_eq!(v1.phase(), Phase::Redundant);
    assert_eq!(v2.phase(), Phase::Active);
    assert_eq!(
      registry.names().unwrap(),
      vec![
        "logo-package-generator-dynamic-v2.0.0",
        "logo-package-generator-v2.0.0"
      ]
    );
  }

  #[tokio::test]
  async fn test_skip_waiting_config_supersedes_immediately() {
    let network = FakeNetwork::new();
    network.respond(&url("/"), Response::new(200, "index"));
    let env = environment(MemoryStorage::new(), network.clone());
    let (client, _rx) = env.subscribers.connect();
    let subscribers = Arc::clone(&env.subscribers);
    let registration = Registration::new(env, true);

    registration.install(v("1.0.0"), manifest(&["/"], &[])).await.unwrap();
    registration.install(v("1.1.0"), manifest(&["/"], &[])).await.unwrap();

    assert_eq!(registration.active().unwrap().descriptor().version, "1.1.0");
    assert!(registration.waiting().is_none());
    assert_eq!(subscribers.controller_of(client).as_deref(), Some("1.1.0"));
  }

  #[tokio::test]
  async fn test_failed_install_keeps_previous_version() {
    let network = FakeNetwork::new();
    network.respond(&url("/a"), Response::new(200, "a"));
    let env = environment(MemoryStorage::new(), network.clone());
    let registry = env.registry.clone();
    let registration = Registration::new(env, true);
    registration.install(v("1.0.0"), manifest(&["/a"], &[])).await.unwrap();

    network.fail(&url("/b"), "unreachable");
    let err = registration
      .install(v("2.0.0"), manifest(&["/a", "/b"], &[]))
      .await
      .unwrap_err();

    assert!(matches!(err, Error::Install(_)));
    assert_eq!(registration.active().unwrap().descriptor().version, "1.0.0");
    assert!(registration.waiting().is_none());
    assert!(!registry.contains("logo-package-generator-v2.0.0").unwrap());
  }

  #[tokio::test]
  async fn test_concurrent_install_is_rejected() {
    let network = FakeNetwork::new();
    network.hang(&url("/slow"));
    let mut env = environment(MemoryStorage::new(), network.clone());
    env.fetch_timeout = std::time::Duration::from_secs(5);
    let registration = Registration::new(env, true);

    let first = registration.install(v("1.0.0"), manifest(&["/slow"], &[]));
    let second = async {
      tokio::task::yield_now().await;
      registration.install(v("2.0.0"), manifest(&[], &[])).await
    };

    tokio::select! {
      _ = first => panic!("hanging install finished"),
      result = second => {
        assert!(matches!(result, Err(Error::Busy { ref version }) if version == "1.0.0"));
      }
    }

    // The dropped install released the slot
    registration.install(v("2.0.0"), manifest(&[], &[])).await.unwrap();
  }

  #[tokio::test]
  async fn test_get_version_ignores_cache_contents() {
    let network = FakeNetwork::new();
    let env = environment(MemoryStorage::new(), network.clone());
    let registry = env.registry.clone();
    let registration = Registration::new(env, true);
    registration.install(v("1.0.0"), manifest(&[], &[])).await.unwrap();

    let expected = VersionInfo {
      version: "1.0.0".to_string(),
      cache_name: "logo-package-generator-v1.0.0".to_string(),
    };
    let reply = registration.handle_message(ClientMessage::GetVersion).await.unwrap();
    assert_eq!(reply, Some(expected.clone()));

    registry.delete("logo-package-generator-v1.0.0").unwrap();
    let handle = registry.open("unrelated").unwrap();
    registry
      .put(&handle, &key(&url("/x")), &Response::new(200, "x"))
      .unwrap();
    let reply = registration.handle_message(ClientMessage::GetVersion).await.unwrap();
    assert_eq!(reply, Some(expected));
  }

  #[tokio::test]
  async fn test_resume_adopts_existing_namespace() {
    let network = FakeNetwork::new();
    let env = environment(MemoryStorage::new(), network.clone());
    let registry = env.registry.clone();
    let registration = Registration::new(env, true);

    assert!(!registration.resume(v("1.0.0"), manifest(&[], &[])).unwrap());
    registry.open("logo-package-generator-v1.0.0").unwrap();
    assert!(registration.resume(v("1.0.0"), manifest(&[], &[])).unwrap());
    assert_eq!(registration.active().unwrap().phase(), Phase::Active);
  }

  #[tokio::test]
  async fn test_fetch_without_active_goes_to_network() {
    let network = FakeNetwork::new();
    network.respond(&url("/x"), Response::new(200, "x"));
    let registration = Registration::new(environment(MemoryStorage::new(), network.clone()), true);

    let served = registration.fetch(&get(&url("/x"))).await.unwrap();
    assert_eq!(served.source, Source::Passthrough);
    assert!(matches!(registration.reconcile().await, Err(Error::NoActiveController)));
  }

  #[tokio::test]
  async fn test_skip_waiting_with_nothing_waiting_is_ignored() {
    let network = FakeNetwork::new();
    let registration = Registration::new(environment(MemoryStorage::new(), network.clone()), false);

    let reply = registration.handle_message(ClientMessage::SkipWaiting).await.unwrap();
    assert_eq!(reply, None);
  }

  #[tokio::test]
  async fn test_superseded_version_leaves_no_namespaces_behind() {
    let network = FakeNetwork::new();
    network.respond(&url("/"), Response::new(200, "index"));
    let gate = network.gate(&url("/late"), Response::new(200, "late"));
    let mut env = environment(MemoryStorage::new(), network.clone());
    env.fetch_timeout = std::time::Duration::from_secs(5);
    let registry = env.registry.clone();
    let registration = Registration::new(env, true);
    let v1 = registration.install(v("1.0.0"), manifest(&["/"], &[])).await.unwrap();

    // A request still in flight through 1.0.0 finishes after 2.0.0 activates
    let late_request = get(&url("/late"));
    let late = registration.fetch(&late_request);
    let upgrade = async {
      registration.install(v("2.0.0"), manifest(&["/"], &[])).await.unwrap();
      gate.notify_one();
    };
    let (served, ()) = tokio::join!(late, upgrade);

    let served = served.unwrap();
    assert_eq!(served.source, Source::Network);
    assert_eq!(served.response.body.as_ref(), b"late");
    assert_eq!(v1.phase(), Phase::Redundant);

    // The retired controller neither routes nor reconciles
    assert!(matches!(
      v1.on_intercept(&get(&url("/late"))).await.unwrap(),
      Intercepted::Bypass(_)
    ));
    assert_eq!(v1.on_reconcile().await, ReconcileReport::default());

    assert_eq!(
      registry.names().unwrap(),
      vec![
        "logo-package-generator-dynamic-v2.0.0",
        "logo-package-generator-v2.0.0"
      ]
    );
  }

  #[tokio::test]
  async fn test_staged_version_activates_with_cleanup() {
    let network = FakeNetwork::new();
    let env = environment(MemoryStorage::new(), network.clone());
    let registry = env.registry.clone();
    registry.open("logo-package-generator-v0.9.0").unwrap();
    let registration = Registration::new(env, true);

    assert!(!registration.stage(v("1.0.0"), manifest(&[], &[])).unwrap());
    registry.open("logo-package-generator-v1.0.0").unwrap();
    assert!(registration.stage(v("1.0.0"), manifest(&[], &[])).unwrap());
    assert_eq!(registration.waiting().unwrap().phase(), Phase::Installed);

    let report = registration.activate_waiting().await.unwrap();

    assert_eq!(report.deleted, vec!["logo-package-generator-v0.9.0"]);
    assert_eq!(registration.active().unwrap().phase(), Phase::Active);
    assert_eq!(network.call_count(), 0);
  }
}
