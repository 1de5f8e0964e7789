//! Refreshes precached assets whose freshness token changed.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{info, warn};

use crate::cache::{CacheStorage, NamespaceHandle, RequestKey};
use crate::manifest::{Manifest, ManifestEntry};
use crate::net::{fetch_with_timeout, FreshnessToken, Request};

use super::bridge::CoreMessage;
use super::lifecycle::Environment;

/// Outcome of one reconciliation pass, identifiers in manifest order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
  pub updated: Vec<String>,
  pub unchanged: Vec<String>,
  pub failed: Vec<String>,
  /// Clients reached by the update broadcast, if one was sent
  pub notified: Option<usize>,
}

enum AssetOutcome {
  Updated,
  Unchanged,
  Failed,
}

pub struct Reconciler<S: CacheStorage> {
  env: Environment<S>,
  manifest: Arc<Manifest>,
  static_name: String,
}

impl<S: CacheStorage> Reconciler<S> {
  pub fn new(env: Environment<S>, static_name: &str, manifest: Arc<Manifest>) -> Self {
    Self {
      env,
      manifest,
      static_name: static_name.to_string(),
    }
  }

  /// Re-fetch every manifest asset and replace stale static entries.
  ///
  /// Per-asset failures are logged and skipped. At most one update broadcast
  /// is sent per pass. A missing static namespace is never recreated: the
  /// pass fails every asset instead.
  pub async fn run(&self) -> ReconcileReport {
    let mut report = ReconcileReport::default();

    match self.env.registry.contains(&self.static_name) {
      Ok(true) => {}
      Ok(false) => {
        warn!(namespace = %self.static_name, "static namespace missing, nothing to refresh");
        report.failed = self.manifest.entries().map(|e| e.id.clone()).collect();
        return report;
      }
      Err(e) => {
        warn!(namespace = %self.static_name, error = %e, "cannot look up static namespace");
        report.failed = self.manifest.entries().map(|e| e.id.clone()).collect();
        return report;
      }
    }
    let handle = NamespaceHandle::existing(&self.static_name);

    let outcomes = join_all(
      self
        .manifest
        .entries()
        .map(|entry| self.refresh(&handle, entry)),
    )
    .await;

    for (entry, outcome) in self.manifest.entries().zip(outcomes) {
      let bucket = match outcome {
        AssetOutcome::Updated => &mut report.updated,
        AssetOutcome::Unchanged => &mut report.unchanged,
        AssetOutcome::Failed => &mut report.failed,
      };
      bucket.push(entry.id.clone());
    }

    if !report.updated.is_empty() {
      let message = CoreMessage::AssetsUpdated {
        assets: report.updated.clone(),
      };
      let reached = self.env.subscribers.broadcast(&message);
      info!(assets = ?report.updated, clients = reached, "announced updated assets");
      report.notified = Some(reached);
    }

    info!(
      updated = report.updated.len(),
      unchanged = report.unchanged.len(),
      failed = report.failed.len(),
      "reconciliation pass finished"
    );
    report
  }

  async fn refresh(&self, handle: &NamespaceHandle, entry: &ManifestEntry) -> AssetOutcome {
    let request = Request::get(entry.url.clone());
    let key = RequestKey::from_request(&request);

    let fresh =
      match fetch_with_timeout(self.env.network.as_ref(), &request, self.env.fetch_timeout).await {
        Ok(response) if response.is_ok() => response,
        Ok(response) => {
          warn!(asset = %entry.id, status = response.status, "refresh returned non-ok status");
          return AssetOutcome::Failed;
        }
        Err(e) => {
          warn!(asset = %entry.id, error = %e, "refresh fetch failed");
          return AssetOutcome::Failed;
        }
      };

    let cached = match self.env.registry.match_in(&handle.name, &key) {
      Ok(cached) => cached,
      Err(e) => {
        warn!(asset = %entry.id, error = %e, "cannot read cached copy");
        return AssetOutcome::Failed;
      }
    };

    let cached_token = cached.as_ref().and_then(|r| r.freshness_token());
    if FreshnessToken::equivalent(cached_token.as_ref(), fresh.freshness_token().as_ref()) {
      return AssetOutcome::Unchanged;
    }

    match self.env.registry.put(handle, &key, &fresh) {
      Ok(()) => AssetOutcome::Updated,
      Err(e) => {
        warn!(asset = %entry.id, error = %e, "failed to store refreshed asset");
        AssetOutcome::Failed
      }
    }
  }
}
