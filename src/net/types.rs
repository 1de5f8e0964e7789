use bytes::Bytes;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use url::Url;

/// An outgoing request as seen by the interception layer.
#[derive(Debug, Clone)]
pub struct Request {
  pub method: Method,
  pub url: Url,
}

impl Request {
  pub fn new(method: Method, url: Url) -> Self {
    Self { method, url }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// Origin of the request url, e.g. `https://example.com:8443`.
  pub fn origin(&self) -> String {
    self.url.origin().ascii_serialization()
  }
}

/// How much of a response the client is allowed to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
  /// Same-origin response
  Basic,
  /// Cross-origin response the origin explicitly shared
  Cors,
  /// Cross-origin response whose content cannot be safely reused
  Opaque,
}

impl ResponseKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Basic => "basic",
      Self::Cors => "cors",
      Self::Opaque => "opaque",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "basic" => Some(Self::Basic),
      "cors" => Some(Self::Cors),
      "opaque" => Some(Self::Opaque),
      _ => None,
    }
  }
}

/// A network or cached response.
///
/// The body is an immutable shared buffer, so a clone is the duplicate that
/// gets cached while the original goes back to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  /// Header pairs with lowercase names, in arrival order
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
  pub kind: ResponseKind,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
      kind: ResponseKind::Basic,
    }
  }

  pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
    self.headers.push((name.to_ascii_lowercase(), value.into()));
    self
  }

  pub fn with_kind(mut self, kind: ResponseKind) -> Self {
    self.kind = kind;
    self
  }

  /// Status is exactly 200.
  pub fn is_ok(&self) -> bool {
    self.status == 200
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(n, _)| n.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Entity tag, falling back to Last-Modified.
  pub fn freshness_token(&self) -> Option<FreshnessToken> {
    self
      .header("etag")
      .or_else(|| self.header("last-modified"))
      .map(|v| FreshnessToken(v.to_string()))
  }
}

/// Opaque comparator deciding whether a cached copy is outdated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreshnessToken(pub String);

impl FreshnessToken {
  /// Two copies are equivalent only when both carry a token and the tokens
  /// match. A missing token on either side forces a refresh.
  pub fn equivalent(cached: Option<&Self>, fresh: Option<&Self>) -> bool {
    matches!((cached, fresh), (Some(a), Some(b)) if a == b)
  }
}
