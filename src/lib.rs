//! Request-interception caching layer.
//!
//! Serves cached responses when available, falls back to the network
//! otherwise, and refreshes precached assets in the background. Cache
//! namespaces are versioned; installing a new version precaches its manifest
//! and activating it removes every namespace of older versions.

pub mod cache;
pub mod config;
pub mod error;
pub mod manifest;
pub mod net;
pub mod worker;

#[cfg(test)]
mod test_utils;

pub use error::{Error, Result};
