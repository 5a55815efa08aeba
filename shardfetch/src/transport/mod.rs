//! HTTP transport abstraction.
//!
//! A [`Transport`] performs the two exchanges a session needs: a `HEAD`
//! request for the archive size and a `GET` for the body from a byte offset.
//! The trait keeps sessions testable without a network:
//!
//! - [`ReqwestTransport`]: HTTP/1.1 over TLS via reqwest
//! - [`MemoryTransport`]: in-memory resources with fault injection

mod http;
mod memory;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use reqwest::Url;

use crate::error::TransportError;

pub use http::{ReqwestTransport, DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_USER_AGENT};
pub use memory::{MemoryResource, MemoryTransport, RecordedRequest, RequestMethod};

/// Streamed response body.
pub type BodyStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Result of a `HEAD` request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeadResponse {
    /// `Content-Length` of the full resource, if reported.
    pub content_length: Option<u64>,
    /// Whether the server advertises `Accept-Ranges: bytes`.
    pub accepts_ranges: bool,
}

/// Response to a `GET`, with the body not yet read.
pub struct BodyResponse {
    /// HTTP status (200 or 206).
    pub status: u16,
    /// `Content-Length` of this response's body.
    pub content_length: Option<u64>,
    /// Parsed `Content-Range`, for 206 responses.
    pub content_range: Option<ContentRange>,
    /// The body.
    pub body: BodyStream,
}

impl BodyResponse {
    /// Whether the server honoured a range request.
    pub fn is_partial(&self) -> bool {
        self.status == 206
    }

    /// Size of the complete resource implied by the headers.
    ///
    /// `offset` is the first byte this response starts at.
    pub fn complete_length(&self, offset: u64) -> Option<u64> {
        match &self.content_range {
            Some(range) if range.complete_length.is_some() => range.complete_length,
            _ => self.content_length.map(|len| offset + len),
        }
    }
}

impl std::fmt::Debug for BodyResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BodyResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .field("content_range", &self.content_range)
            .finish_non_exhaustive()
    }
}

/// A parsed `Content-Range: bytes <start>-<end>/<complete>` header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContentRange {
    /// First byte in the response.
    pub start: u64,
    /// Last byte in the response (inclusive).
    pub end: u64,
    /// Size of the complete resource, or `None` for `*`.
    pub complete_length: Option<u64>,
}

impl ContentRange {
    /// Parses a `Content-Range` header value.
    pub fn parse(value: &str) -> Option<Self> {
        let spec = value.trim().strip_prefix("bytes")?.trim_start();
        let (range, complete) = spec.split_once('/')?;
        let (start, end) = range.trim().split_once('-')?;
        let start = start.trim().parse().ok()?;
        let end = end.trim().parse().ok()?;
        if end < start {
            return None;
        }
        let complete_length = match complete.trim() {
            "*" => None,
            len => Some(len.parse().ok()?),
        };
        Some(Self {
            start,
            end,
            complete_length,
        })
    }

    /// Parses the `bytes */<length>` form sent with a 416 answer.
    pub fn parse_unsatisfied(value: &str) -> Option<u64> {
        let spec = value.trim().strip_prefix("bytes")?.trim_start();
        let length = spec.strip_prefix('*')?.trim_start().strip_prefix('/')?;
        length.trim().parse().ok()
    }

    /// Formats the header value for a range starting at `start` of a
    /// resource of `complete_length` bytes.
    pub fn header_value(start: u64, complete_length: u64) -> String {
        format!(
            "bytes {}-{}/{}",
            start,
            complete_length.saturating_sub(1),
            complete_length
        )
    }
}

/// Remote access used by sessions.
pub trait Transport: Send + Sync + 'static {
    /// Sends `HEAD` for `url`.
    fn head<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<HeadResponse, TransportError>>;

    /// Sends `GET` for `url`, with `Range: bytes=<offset>-` when `offset > 0`.
    ///
    /// A 416 answer is returned as [`TransportError::RangeNotSatisfiable`];
    /// other statuses besides 200 and 206 as [`TransportError::Status`].
    fn fetch<'a>(
        &'a self,
        url: &'a Url,
        offset: u64,
    ) -> BoxFuture<'a, Result<BodyResponse, TransportError>>;
}

/// Formats the `Range` header requesting everything from `offset` onward.
pub fn range_header(offset: u64) -> String {
    format!("bytes={}-", offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_content_range() {
        assert_eq!(
            ContentRange::parse("bytes 100-199/1000"),
            Some(ContentRange {
                start: 100,
                end: 199,
                complete_length: Some(1000)
            })
        );
        assert_eq!(
            ContentRange::parse("bytes 0-9/*"),
            Some(ContentRange {
                start: 0,
                end: 9,
                complete_length: None
            })
        );
    }

    #[test]
    fn test_parse_content_range_rejects_malformed() {
        assert_eq!(ContentRange::parse("items 0-9/10"), None);
        assert_eq!(ContentRange::parse("bytes 9-0/10"), None);
        assert_eq!(ContentRange::parse("bytes */10"), None);
        assert_eq!(ContentRange::parse("bytes 0-9"), None);
    }

    #[test]
    fn test_parse_unsatisfied_range() {
        assert_eq!(ContentRange::parse_unsatisfied("bytes */40"), Some(40));
        assert_eq!(ContentRange::parse_unsatisfied(" bytes * / 7 "), Some(7));
        assert_eq!(ContentRange::parse_unsatisfied("bytes 0-9/40"), None);
        assert_eq!(ContentRange::parse_unsatisfied("bytes */*"), None);
    }

    #[test]
    fn test_header_value_round_trip() {
        let value = ContentRange::header_value(40, 100);
        assert_eq!(value, "bytes 40-99/100");
        assert_eq!(ContentRange::parse(&value).unwrap().start, 40);
    }

    #[test]
    fn test_range_header() {
        assert_eq!(range_header(4096), "bytes=4096-");
    }

    #[test]
    fn test_complete_length() {
        let response = BodyResponse {
            status: 206,
            content_length: Some(60),
            content_range: ContentRange::parse("bytes 40-99/100"),
            body: Box::pin(futures::stream::empty()),
        };
        assert!(response.is_partial());
        assert_eq!(response.complete_length(40), Some(100));

        let response = BodyResponse {
            status: 200,
            content_length: Some(100),
            content_range: None,
            body: Box::pin(futures::stream::empty()),
        };
        assert_eq!(response.complete_length(0), Some(100));
    }
}
