use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::header::{HeaderMap, ACCESS_CONTROL_ALLOW_ORIGIN};
use tracing::debug;
use url::Url;

use crate::config::Config;
use crate::error::FetchError;

use super::types::{Request, Response, ResponseKind};

/// The seam every fetch of the cache core goes through.
pub trait Network: Send + Sync {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, FetchError>>;
}

/// Run a fetch, giving up after `timeout`.
pub async fn fetch_with_timeout(
  network: &dyn Network,
  request: &Request,
  timeout: Duration,
) -> Result<Response, FetchError> {
  match tokio::time::timeout(timeout, network.fetch(request)).await {
    Ok(result) => result,
    Err(_) => Err(FetchError::Timeout {
      url: request.url.to_string(),
      timeout,
    }),
  }
}

/// Network backed by a reqwest client.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
  host_origin: String,
  timeout: Duration,
}

impl HttpNetwork {
  pub fn new(config: &Config) -> Result<Self, FetchError> {
    let client = reqwest::Client::builder()
      .timeout(config.fetch_timeout())
      .user_agent(config.user_agent.as_str())
      .build()
      .map_err(FetchError::transport)?;

    Ok(Self {
      client,
      host_origin: config.host_origin.origin().ascii_serialization(),
      timeout: config.fetch_timeout(),
    })
  }

  async fn send(&self, request: &Request) -> Result<Response, FetchError> {
    let response = self
      .client
      .request(request.method.clone(), request.url.clone())
      .send()
      .await
      .map_err(|e| {
        if e.is_timeout() {
          FetchError::Timeout {
            url: request.url.to_string(),
            timeout: self.timeout,
          }
        } else {
          FetchError::transport(e)
        }
      })?;

    let kind = classify(&self.host_origin, response.url(), response.headers());
    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = response.bytes().await.map_err(FetchError::transport)?;

    debug!(url = %request.url, status, kind = kind.as_str(), "network response");

    Ok(Response {
      status,
      headers,
      body,
      kind,
    })
  }
}

/// Classify a response the way a browser would expose it to the page.
///
/// `final_url` is where the response came from after redirects, so a
/// same-origin request redirected to a foreign host is judged by that host.
fn classify(host_origin: &str, final_url: &Url, headers: &HeaderMap) -> ResponseKind {
  if final_url.origin().ascii_serialization() == host_origin {
    return ResponseKind::Basic;
  }

  match headers.get(ACCESS_CONTROL_ALLOW_ORIGIN) {
    Some(value) if value.as_bytes() == b"*" || value.as_bytes() == host_origin.as_bytes() => {
      ResponseKind::Cors
    }
    _ => ResponseKind::Opaque,
  }
}

impl Network for HttpNetwork {
  fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, FetchError>> {
    Box::pin(self.send(request))
  }
}
