use serde::{Deserialize, Serialize};

use crate::cache::NamespaceRole;

/// Names of the namespaces owned by one version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionDescriptor {
  pub version: String,
  pub static_name: String,
  pub dynamic_name: String,
}

impl VersionDescriptor {
  /// `<prefix>-v<version>` for static assets, `<prefix>-dynamic-v<version>` for
  /// runtime responses.
  pub fn new(prefix: &str, version: &str) -> Self {
    Self {
      version: version.to_string(),
      static_name: format!("{}-v{}", prefix, version),
      dynamic_name: format!("{}-dynamic-v{}", prefix, version),
    }
  }

  pub fn with_names(version: &str, static_name: &str, dynamic_name: &str) -> Self {
    Self {
      version: version.to_string(),
      static_name: static_name.to_string(),
      dynamic_name: dynamic_name.to_string(),
    }
  }

  pub fn name(&self, role: NamespaceRole) -> &str {
    match role {
      NamespaceRole::Static => &self.static_name,
      NamespaceRole::Dynamic => &self.dynamic_name,
    }
  }

  /// Whether `name` is one of this version's current namespaces.
  pub fn owns(&self, name: &str) -> bool {
    name == self.static_name || name == self.dynamic_name
  }

  pub fn info(&self) -> VersionInfo {
    VersionInfo {
      version: self.version.clone(),
      cache_name: self.static_name.clone(),
    }
  }
}

/// Reply to a `GET_VERSION` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
  pub version: String,
  #[serde(rename = "cacheName")]
  pub cache_name: String,
}
