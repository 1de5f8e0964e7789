//! Named-namespace registry over a storage backend.

use std::sync::Arc;

use tracing::debug;

use crate::error::StoreError;
use crate::net::Response;

use super::storage::CacheStorage;
use super::traits::{CachedEntry, NamespaceHandle, RequestKey};

/// Process-wide registry of cache namespaces.
///
/// Cloning is cheap and every clone shares the same backend. The backend is
/// the only shared mutable state of the cache core.
pub struct StoreRegistry<S: CacheStorage> {
  storage: Arc<S>,
}

impl<S: CacheStorage> StoreRegistry<S> {
  pub fn new(storage: S) -> Self {
    Self {
      storage: Arc::new(storage),
    }
  }

  /// Open a namespace, creating it if absent.
  pub fn open(&self, name: &str) -> Result<NamespaceHandle, StoreError> {
    let created = self.storage.open_namespace(name)?;
    if created {
      debug!(namespace = name, "created namespace");
    }
    Ok(NamespaceHandle {
      name: name.to_string(),
      created,
    })
  }

  pub fn contains(&self, name: &str) -> Result<bool, StoreError> {
    self.storage.has_namespace(name)
  }

  /// Store a response. Fails if the namespace was deleted since it was
  /// opened.
  pub fn put(
    &self,
    handle: &NamespaceHandle,
    key: &RequestKey,
    response: &Response,
  ) -> Result<(), StoreError> {
    self.storage.put(&handle.name, key, response)
  }

  /// Look a key up in one namespace.
  pub fn match_in(&self, name: &str, key: &RequestKey) -> Result<Option<Response>, StoreError> {
    Ok(self.entry(name, key)?.map(|entry| entry.response))
  }

  pub fn entry(&self, name: &str, key: &RequestKey) -> Result<Option<CachedEntry>, StoreError> {
    self.storage.get(name, key)
  }

  /// Look a key up in each namespace of `order`; the first match wins.
  pub fn match_any<N: AsRef<str>>(
    &self,
    order: &[N],
    key: &RequestKey,
  ) -> Result<Option<Response>, StoreError> {
    for name in order {
      if let Some(response) = self.match_in(name.as_ref(), key)? {
        return Ok(Some(response));
      }
    }
    Ok(None)
  }

  pub fn names(&self) -> Result<Vec<String>, StoreError> {
    self.storage.namespaces()
  }

  pub fn delete(&self, name: &str) -> Result<bool, StoreError> {
    let removed = self.storage.delete_namespace(name)?;
    if removed {
      debug!(namespace = name, "deleted namespace");
    }
    Ok(removed)
  }

  pub fn keys(&self, name: &str) -> Result<Vec<RequestKey>, StoreError> {
    self.storage.keys(name)
  }
}

impl<S: CacheStorage> Clone for StoreRegistry<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
    }
  }
}
