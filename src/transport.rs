//! Network transport used by the preload cache.

use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, warn};
use url::Url;

use crate::descriptor::{Method, Params};
use crate::key::{append_query, serialize_params};

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(30_000);

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Transport-level metadata surfaced to completion callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMeta {
  /// HTTP status code, `0` when no response arrived
  pub status: u16,
  /// Final URL the request was sent to
  pub url: String,
}

/// A fully decorated request, ready to go on the wire.
#[derive(Debug, Clone)]
pub struct TransportRequest {
  pub url: String,
  pub method: Method,
  pub params: Params,
  pub content_type: Option<String>,
  pub timeout: Duration,
}

/// What the transport yields for one request.
#[derive(Debug, Clone)]
pub enum TransportReply {
  /// Status 200 with its raw body
  Ok { body: String, meta: TransportMeta },
  /// Network error, timeout, or any other status
  Failed { meta: TransportMeta },
}

/// Performs network calls on behalf of the cache.
///
/// Implementations must resolve every request exactly once. Timeouts are the
/// transport's job and resolve as `Failed`.
pub trait Transport: Send + Sync + 'static {
  fn send(&self, request: TransportRequest) -> BoxFuture<'static, TransportReply>;
}

/// `reqwest`-backed transport. Relative URLs resolve against `base`.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base: Url,
}

impl HttpTransport {
  pub fn new(base: Url) -> Self {
    Self {
      client: reqwest::Client::new(),
      base,
    }
  }

  pub fn with_client(client: reqwest::Client, base: Url) -> Self {
    Self { client, base }
  }
}

impl Transport for HttpTransport {
  fn send(&self, request: TransportRequest) -> BoxFuture<'static, TransportReply> {
    let client = self.client.clone();
    let base = self.base.clone();

    Box::pin(async move {
      let raw_url = match request.method {
        Method::Get => append_query(&request.url, &request.params),
        Method::Post => request.url.clone(),
      };

      let url = match base.join(&raw_url) {
        Ok(url) => url,
        Err(e) => {
          warn!(url = %raw_url, error = %e, "Cannot resolve request URL");
          return TransportReply::Failed {
            meta: TransportMeta {
              status: 0,
              url: raw_url,
            },
          };
        }
      };

      let mut builder = match request.method {
        Method::Get => client.get(url.clone()),
        Method::Post => client
          .post(url.clone())
          .body(serialize_params(&request.params)),
      };
      builder = builder.timeout(request.timeout);

      if request.content_type.is_some() || request.method == Method::Post {
        let content_type = request.content_type.as_deref().unwrap_or(FORM_CONTENT_TYPE);
        builder = builder.header(CONTENT_TYPE, content_type);
      }

      debug!(method = %request.method, url = %url, "Sending request");

      let response = match builder.send().await {
        Ok(response) => response,
        Err(e) => {
          warn!(url = %url, error = %e, timeout = e.is_timeout(), "Request failed");
          return TransportReply::Failed {
            meta: TransportMeta {
              status: e.status().map(|s| s.as_u16()).unwrap_or(0),
              url: url.to_string(),
            },
          };
        }
      };

      let meta = TransportMeta {
        status: response.status().as_u16(),
        url: response.url().to_string(),
      };

      if meta.status != 200 {
        return TransportReply::Failed { meta };
      }

      match response.text().await {
        Ok(body) => TransportReply::Ok { body, meta },
        Err(e) => {
          warn!(url = %meta.url, error = %e, "Failed to read response body");
          TransportReply::Failed { meta }
        }
      }
    })
  }
}
