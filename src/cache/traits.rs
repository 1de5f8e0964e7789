//! Core types for cache namespaces and entries.

use std::fmt;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::manifest::without_fragment;
use crate::net::{Request, Response};

/// Normalized request identity: method plus url without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  pub method: String,
  pub url: String,
}

impl RequestKey {
  pub fn from_request(request: &Request) -> Self {
    Self {
      method: request.method.as_str().to_ascii_uppercase(),
      url: without_fragment(&request.url).to_string(),
    }
  }

  /// SHA256 of the key for stable, fixed-length storage keys.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// Which current namespace of a version a name plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceRole {
  /// Precached, version-pinned assets
  Static,
  /// Responses cached opportunistically at runtime
  Dynamic,
}

/// Handle to an opened namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceHandle {
  pub name: String,
  /// Whether `open` created the namespace
  pub created: bool,
}

impl NamespaceHandle {
  /// Handle to a namespace opened earlier. Writes through it fail once the
  /// namespace is deleted.
  pub fn existing(name: &str) -> Self {
    Self {
      name: name.to_string(),
      created: false,
    }
  }
}

/// A stored response with its storage timestamp.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: Response,
  pub cached_at: DateTime<Utc>,
}
