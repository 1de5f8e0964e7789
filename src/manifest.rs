//! Build-time list of assets to precache.

use std::collections::HashSet;

use url::Url;

use crate::error::InstallError;

/// One precached asset: the identifier as written in the manifest and the
/// absolute url it resolves to against the host origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
  pub id: String,
  pub url: Url,
}

/// Ordered first-party assets plus explicitly allowed third-party urls.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
  first_party: Vec<ManifestEntry>,
  third_party: Vec<ManifestEntry>,
  first_party_urls: HashSet<String>,
  third_party_urls: HashSet<String>,
}

impl Manifest {
  /// Resolve every identifier against `host_origin`.
  pub fn resolve<I, J>(host_origin: &Url, first_party: I, third_party: J) -> Result<Self, InstallError>
  where
    I: IntoIterator,
    I::Item: AsRef<str>,
    J: IntoIterator,
    J::Item: AsRef<str>,
  {
    let first_party = resolve_all(host_origin, first_party)?;
    let third_party = resolve_all(host_origin, third_party)?;

    Ok(Self {
      first_party_urls: first_party.iter().map(|e| e.url.to_string()).collect(),
      third_party_urls: third_party.iter().map(|e| e.url.to_string()).collect(),
      first_party,
      third_party,
    })
  }

  /// All entries, first-party before third-party, in manifest order.
  pub fn entries(&self) -> impl Iterator<Item = &ManifestEntry> {
    self.first_party.iter().chain(self.third_party.iter())
  }

  pub fn len(&self) -> usize {
    self.first_party.len() + self.third_party.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn is_first_party(&self, url: &Url) -> bool {
    self.first_party_urls.contains(without_fragment(url).as_str())
  }

  pub fn is_third_party_allowed(&self, url: &Url) -> bool {
    self.third_party_urls.contains(without_fragment(url).as_str())
  }
}

fn resolve_all<I>(host_origin: &Url, ids: I) -> Result<Vec<ManifestEntry>, InstallError>
where
  I: IntoIterator,
  I::Item: AsRef<str>,
{
  ids
    .into_iter()
    .map(|id| {
      let id = id.as_ref();
      let url = host_origin
        .join(id)
        .map_err(|_| InstallError::InvalidAsset {
          asset: id.to_string(),
        })?;
      Ok(ManifestEntry {
        id: id.to_string(),
        url: without_fragment(&url),
      })
    })
    .collect()
}

pub(crate) fn without_fragment(url: &Url) -> Url {
  let mut url = url.clone();
  url.set_fragment(None);
  url
}

#[cfg(test)]
mod tests {
  use super::*;

  fn origin() -> Url {
    "https://logo.example.com".parse().unwrap()
  }

  #[test]
  fn test_resolves_paths_against_origin() {
    let manifest = Manifest::resolve(
      &origin(),
      ["/", "/index.html"],
      ["https://fonts.example.net/inter.css"],
    )
    .unwrap();

    let urls: Vec<String> = manifest.entries().map(|e| e.url.to_string()).collect();
    assert_eq!(
      urls,
      vec![
        "https://logo.example.com/",
        "https://logo.example.com/index.html",
        "https://fonts.example.net/inter.css",
      ]
    );
    assert_eq!(manifest.entries().nth(1).unwrap().id, "/index.html");
  }

  #[test]
  fn test_membership_ignores_fragment() {
    let manifest =
      Manifest::resolve(&origin(), ["/app.js"], ["https://cdn.example.net/lib.js"]).unwrap();

    assert!(manifest.is_first_party(&"https://logo.example.com/app.js#x".parse().unwrap()));
    assert!(manifest.is_third_party_allowed(&"https://cdn.example.net/lib.js".parse().unwrap()));
    assert!(!manifest.is_third_party_allowed(&"https://cdn.example.net/other.js".parse().unwrap()));
  }

  #[test]
  fn test_invalid_asset_is_rejected() {
    let err = Manifest::resolve(&origin(), Vec::<String>::new(), ["http://[::1"]).unwrap_err();
    assert!(matches!(err, InstallError::InvalidAsset { .. }));
  }
}
