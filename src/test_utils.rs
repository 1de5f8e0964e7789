//! Fakes shared by the unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Notify;

use crate::cache::{CacheStorage, CachedEntry, MemoryStorage, RequestKey, StoreRegistry};
use crate::error::{FetchError, StoreError};
use crate::manifest::Manifest;
use crate::net::{Network, Request, Response};
use crate::worker::{Environment, RoutePolicy, SubscriberRegistry};

pub const ORIGIN: &str = "https://logo.example.com";

#[derive(Clone)]
enum Route {
  Respond(Response),
  Fail(String),
  Hang,
  /// Answer once the gate is opened
  Gate(Arc<Notify>, Response),
}

/// Network answering from a route table and recording every call.
#[derive(Default)]
pub struct FakeNetwork {
  routes: Mutex<HashMap<String, Route>>,
  calls: Mutex<Vec<String>>,
}

impl FakeNetwork {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn respond(&self, url: &str, response: Response) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), Route::Respond(response));
  }

  pub fn fail(&self, url: &str, message: &str) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), Route::Fail(message.to_string()));
  }

  pub fn hang(&self, url: &str) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), Route::Hang);
  }

  /// Hold requests for `url` until the returned gate is notified.
  pub fn gate(&self, url: &str, response: Response) -> Arc<Notify> {
    let gate = Arc::new(Notify::new());
    self
      .routes
      .lock()
      .unwrap()
      .insert(url.to_string(), Route::Gate(Arc::clone(&gate), response));
    gate
  }

  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }
}

impl Network for FakeNetwork {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, FetchError>> {
    let url = request.url.to_string();
    self.calls.lock().unwrap().push(url.clone());
    let route = self.routes.lock().unwrap().get(&url).cloned();

    Box::pin(async move {
      match route {
        Some(Route::Respond(response)) => Ok(response),
        Some(Route::Fail(message)) => Err(FetchError::transport(message)),
        Some(Route::Hang) => futures::future::pending().await,
        Some(Route::Gate(gate, response)) => {
          gate.notified().await;
          Ok(response)
        }
        None => Err(FetchError::transport(format!("no route for {}", url))),
      }
    })
  }
}

/// Memory storage that fails writes or deletes on demand.
#[derive(Default)]
pub struct FlakyStorage {
  inner: MemoryStorage,
  fail_puts: AtomicBool,
  fail_deletes: Mutex<HashSet<String>>,
}

impl FlakyStorage {
  pub fn fail_puts(&self, fail: bool) {
    self.fail_puts.store(fail, Ordering::SeqCst);
  }

  pub fn fail_delete_of(&self, name: &str) {
    self.fail_deletes.lock().unwrap().insert(name.to_string());
  }
}

fn injected() -> StoreError {
  StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, "injected"))
}

impl CacheStorage for FlakyStorage {
  fn open_namespace(&self, name: &str) -> Result<bool, StoreError> {
    self.inner.open_namespace(name)
  }

  fn has_namespace(&self, name: &str) -> Result<bool, StoreError> {
    self.inner.has_namespace(name)
  }

  fn put(&self, namespace: &str, key: &RequestKey, response: &Response) -> Result<(), StoreError> {
    if self.fail_puts.load(Ordering::SeqCst) {
      return Err(injected());
    }
    self.inner.put(namespace, key, response)
  }

  fn get(&self, namespace: &str, key: &RequestKey) -> Result<Option<CachedEntry>, StoreError> {
    self.inner.get(namespace, key)
  }

  fn namespaces(&self) -> Result<Vec<String>, StoreError> {
    self.inner.namespaces()
  }

  fn delete_namespace(&self, name: &str) -> Result<bool, StoreError> {
    if self.fail_deletes.lock().unwrap().contains(name) {
      return Err(injected());
    }
    self.inner.delete_namespace(name)
  }

  fn keys(&self, namespace: &str) -> Result<Vec<RequestKey>, StoreError> {
    self.inner.keys(namespace)
  }
}

pub fn url(path: &str) -> String {
  format!("{}{}", ORIGIN, path)
}

pub fn get(url: &str) -> Request {
  Request::get(url.parse().unwrap())
}

pub fn key(url: &str) -> RequestKey {
  RequestKey::from_request(&get(url))
}

pub fn manifest(first_party: &[&str], third_party: &[&str]) -> Arc<Manifest> {
  Arc::new(Manifest::resolve(&ORIGIN.parse().unwrap(), first_party, third_party).unwrap())
}

pub fn environment<S: CacheStorage>(storage: S, network: Arc<FakeNetwork>) -> Environment<S> {
  Environment {
    registry: StoreRegistry::new(storage),
    network,
    subscribers: Arc::new(SubscriberRegistry::new()),
    policy: Arc::new(RoutePolicy::new(
      ORIGIN.parse().unwrap(),
      ["chrome-extension".to_string()],
      ["https://api.example.com".to_string()],
    )),
    fetch_timeout: Duration::from_millis(200),
  }
}
