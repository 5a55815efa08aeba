//! reqwest-backed transport: HTTP/1.1 over TLS.

use std::time::Duration;

use futures::future::BoxFuture;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, Response, Url};
use tracing::debug;

use super::{range_header, BodyResponse, ContentRange, HeadResponse, Transport};
use crate::error::TransportError;

/// Default timeout for establishing a connection (TCP + TLS).
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default user agent.
pub const DEFAULT_USER_AGENT: &str = concat!("shardfetch/", env!("CARGO_PKG_VERSION"));

/// Transport over a pooled reqwest client.
///
/// The body is streamed without an overall deadline; stalled reads are
/// bounded by the session's per-read timeout instead.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    client: Client,
    connect_timeout: Duration,
}

impl ReqwestTransport {
    /// Create a transport with default settings.
    pub fn new() -> Result<Self, TransportError> {
        Self::with_settings(
            Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            DEFAULT_USER_AGENT,
        )
    }

    /// Create a transport with a custom connect timeout and user agent.
    pub fn with_settings(connect_timeout: Duration, user_agent: &str) -> Result<Self, TransportError> {
        let client = Client::builder()
            .use_rustls_tls()
            .http1_only()
            .connect_timeout(connect_timeout)
            .user_agent(user_agent)
            .build()
            .map_err(|e| TransportError::Client(e.to_string()))?;

        Ok(Self {
            client,
            connect_timeout,
        })
    }

    fn classify(&self, url: &Url, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout {
                url: url.to_string(),
                timeout: self.connect_timeout,
            }
        } else if err.is_connect() || err.is_request() {
            TransportError::Connect {
                url: url.to_string(),
                reason: err.to_string(),
            }
        } else {
            TransportError::Body {
                url: url.to_string(),
                reason: err.to_string(),
            }
        }
    }
}

fn header_u64(response: &Response, name: reqwest::header::HeaderName) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
}

impl Transport for ReqwestTransport {
    fn head<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<HeadResponse, TransportError>> {
        Box::pin(async move {
            let response = self
                .client
                .head(url.clone())
                .send()
                .await
                .map_err(|e| self.classify(url, e))?;

            if !response.status().is_success() {
                return Err(TransportError::Status {
                    method: "HEAD",
                    url: url.to_string(),
                    status: response.status().as_u16(),
                });
            }

            // Read the header directly; the body of a HEAD response is empty.
            let content_length = header_u64(&response, CONTENT_LENGTH);
            let accepts_ranges = response
                .headers()
                .get(ACCEPT_RANGES)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.eq_ignore_ascii_case("bytes"))
                .unwrap_or(false);

            debug!(url = %url, content_length = ?content_length, accepts_ranges, "HEAD complete");
            Ok(HeadResponse {
                content_length,
                accepts_ranges,
            })
        })
    }

    fn fetch<'a>(
        &'a self,
        url: &'a Url,
        offset: u64,
    ) -> BoxFuture<'a, Result<BodyResponse, TransportError>> {
        Box::pin(async move {
            let mut request = self.client.get(url.clone());
            if offset > 0 {
                request = request.header(RANGE, range_header(offset));
            }

            let response = request.send().await.map_err(|e| self.classify(url, e))?;

            let status = response.status().as_u16();
            if status == 416 {
                let complete_length = response
                    .headers()
                    .get(CONTENT_RANGE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(ContentRange::parse_unsatisfied);
                debug!(url = %url, offset, complete_length = ?complete_length, "Range not satisfiable");
                return Err(TransportError::RangeNotSatisfiable {
                    url: url.to_string(),
                    complete_length,
                });
            }
            if status != 200 && status != 206 {
                return Err(TransportError::Status {
                    method: "GET",
                    url: url.to_string(),
                    status,
                });
            }

            let content_length = header_u64(&response, CONTENT_LENGTH);
            let content_range = response
                .headers()
                .get(CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .and_then(ContentRange::parse);

            debug!(
                url = %url,
                offset,
                status,
                content_length = ?content_length,
                content_range = ?content_range,
                "GET response received"
            );

            let body_url = url.to_string();
            let body = response
                .bytes_stream()
                .map_err(move |e| TransportError::Body {
                    url: body_url.clone(),
                    reason: e.to_string(),
                })
                .boxed();

            Ok(BodyResponse {
                status,
                content_length,
                content_range,
                body,
            })
        })
    }
}
