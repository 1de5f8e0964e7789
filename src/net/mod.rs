//! Network access for the cache core.

pub mod client;
pub mod types;

pub use client::{fetch_with_timeout, HttpNetwork, Network};
pub use types::{FreshnessToken, Request, Response, ResponseKind};
