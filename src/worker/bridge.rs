//! Message channel between the cache core and connected clients.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// Client to core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
  /// Activate the waiting version now
  SkipWaiting,
  /// Ask for the active version and its cache name
  GetVersion,
}

/// Core to clients, broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CoreMessage {
  AssetsUpdated { assets: Vec<String> },
}

pub type ClientId = u64;

struct Subscriber {
  tx: mpsc::UnboundedSender<CoreMessage>,
  /// Version controlling this client, set when a version claims it
  controller: Option<String>,
}

/// Connected clients and the capability to send to each.
#[derive(Default)]
pub struct SubscriberRegistry {
  next_id: AtomicU64,
  subscribers: Mutex<BTreeMap<ClientId, Subscriber>>,
}

impl SubscriberRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, BTreeMap<ClientId, Subscriber>> {
    self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
  }

  /// Register a client. Core messages arrive on the returned receiver.
  pub fn connect(&self) -> (ClientId, mpsc::UnboundedReceiver<CoreMessage>) {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = mpsc::unbounded_channel();
    self.lock().insert(
      id,
      Subscriber {
        tx,
        controller: None,
      },
    );
    debug!(client = id, "client connected");
    (id, rx)
  }

  pub fn disconnect(&self, id: ClientId) {
    if self.lock().remove(&id).is_some() {
      debug!(client = id, "client disconnected");
    }
  }

  /// Send to every connected client. Clients whose receiver is gone are
  /// dropped. Returns the number of clients reached.
  pub fn broadcast(&self, message: &CoreMessage) -> usize {
    let mut subscribers = self.lock();
    subscribers.retain(|_, s| s.tx.send(message.clone()).is_ok());
    subscribers.len()
  }

  /// Make `version` the controller of every connected client.
  pub fn claim(&self, version: &str) -> usize {
    let mut subscribers = self.lock();
    for subscriber in subscribers.values_mut() {
      subscriber.controller = Some(version.to_string());
    }
    subscribers.len()
  }

  pub fn controller_of(&self, id: ClientId) -> Option<String> {
    self.lock().get(&id).and_then(|s| s.controller.clone())
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
