//! In-memory transport with fault injection.
//!
//! Serves registered [`MemoryResource`]s as if they were remote archives and
//! records every request it receives. Faults (refused connections, dropped
//! streams, ignored ranges, wrong lengths) are configured per resource.

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::Url;

use super::{BodyResponse, BodyStream, ContentRange, HeadResponse, Transport};
use crate::error::TransportError;

/// Default size of each body piece handed to the reader.
const DEFAULT_PIECE_SIZE: usize = 8 * 1024;

/// Request method seen by the transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestMethod {
    Head,
    Get,
}

/// A request received by a [`MemoryTransport`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedRequest {
    pub method: RequestMethod,
    pub url: String,
    /// Range start for `GET` (0 when no range was requested).
    pub offset: u64,
}

/// An archive served by a [`MemoryTransport`].
#[derive(Clone, Debug)]
pub struct MemoryResource {
    body: Bytes,
    piece_size: usize,
    read_delay: Option<Duration>,
    disconnect_after: Option<u64>,
    disconnects: u32,
    refused_connections: u32,
    ignore_range: bool,
    reported_length: Option<u64>,
    hide_length: bool,
    status: Option<u16>,
    head_status: Option<u16>,
}

impl MemoryResource {
    /// Creates a resource serving `body`.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            piece_size: DEFAULT_PIECE_SIZE,
            read_delay: None,
            disconnect_after: None,
            disconnects: 0,
            refused_connections: 0,
            ignore_range: false,
            reported_length: None,
            hide_length: false,
            status: None,
            head_status: None,
        }
    }

    /// Delivers the body in pieces of `size` bytes.
    pub fn with_piece_size(mut self, size: usize) -> Self {
        self.piece_size = size.max(1);
        self
    }

    /// Sleeps before delivering each piece.
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = Some(delay);
        self
    }

    /// Breaks the next `times` body streams after `bytes` bytes each.
    pub fn with_disconnects(mut self, bytes: u64, times: u32) -> Self {
        self.disconnect_after = Some(bytes);
        self.disconnects = times;
        self
    }

    /// Refuses the next `times` requests with a connection error.
    pub fn with_refused_connections(mut self, times: u32) -> Self {
        self.refused_connections = times;
        self
    }

    /// Answers range requests with `200` and the full body.
    pub fn ignoring_range(mut self) -> Self {
        self.ignore_range = true;
        self
    }

    /// Reports `length` as the resource size instead of the real one.
    pub fn with_reported_length(mut self, length: u64) -> Self {
        self.reported_length = Some(length);
        self
    }

    /// Omits `Content-Length` and the complete length in `Content-Range`.
    pub fn without_length(mut self) -> Self {
        self.hide_length = true;
        self
    }

    /// Answers every request with `status`.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Answers `HEAD` with `status`; `GET` is served normally.
    pub fn rejecting_head(mut self, status: u16) -> Self {
        self.head_status = Some(status);
        self
    }

    fn length(&self) -> Option<u64> {
        if self.hide_length {
            None
        } else {
            Some(self.reported_length.unwrap_or(self.body.len() as u64))
        }
    }
}

/// Transport serving in-memory resources.
#[derive(Default)]
pub struct MemoryTransport {
    resources: Mutex<HashMap<String, MemoryResource>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl MemoryTransport {
    /// Creates an empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serves `resource` at `url`.
    pub fn insert(&self, url: &str, resource: MemoryResource) {
        let key = normalize(url);
        self.resources.lock().insert(key, resource);
    }

    /// Every request received so far.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    /// Range offsets of the `GET` requests for `url`.
    pub fn get_offsets(&self, url: &str) -> Vec<u64> {
        let key = normalize(url);
        self.requests
            .lock()
            .iter()
            .filter(|r| r.method == RequestMethod::Get && r.url == key)
            .map(|r| r.offset)
            .collect()
    }

    fn record(&self, method: RequestMethod, url: &Url, offset: u64) {
        self.requests.lock().push(RecordedRequest {
            method,
            url: url.to_string(),
            offset,
        });
    }

    /// Looks up a resource, applying connection-level faults.
    fn connect(&self, method: &'static str, url: &Url) -> Result<MemoryResource, TransportError> {
        let mut resources = self.resources.lock();
        let resource = resources
            .get_mut(url.as_str())
            .ok_or_else(|| TransportError::Status {
                method,
                url: url.to_string(),
                status: 404,
            })?;

        if resource.refused_connections > 0 {
            resource.refused_connections -= 1;
            return Err(TransportError::Connect {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        if let Some(status) = resource.status {
            return Err(TransportError::Status {
                method,
                url: url.to_string(),
                status,
            });
        }

        let snapshot = resource.clone();
        if method == "GET" && resource.disconnects > 0 {
            resource.disconnects -= 1;
        }
        Ok(snapshot)
    }
}

fn normalize(url: &str) -> String {
    Url::parse(url)
        .map(|u| u.to_string())
        .unwrap_or_else(|_| url.to_string())
}

fn body_stream(resource: &MemoryResource, url: &Url, body: Bytes) -> BodyStream {
    let cut = (resource.disconnects > 0)
        .then_some(resource.disconnect_after)
        .flatten();
    let piece_size = resource.piece_size;
    let delay = resource.read_delay;
    let url = url.to_string();

    futures::stream::unfold(0usize, move |sent| {
        let body = body.clone();
        let url = url.clone();
        async move {
            if let Some(cut) = cut {
                if sent as u64 >= cut {
                    if sent >= body.len() {
                        return None;
                    }
                    let err = TransportError::Body {
                        url,
                        reason: "connection reset by peer".to_string(),
                    };
                    // Terminate after reporting the fault.
                    return Some((Err(err), usize::MAX));
                }
            }
            if sent >= body.len() {
                return None;
            }
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let mut end = (sent + piece_size).min(body.len());
            if let Some(cut) = cut {
                end = end.min(cut as usize).max(sent + 1);
            }
            Some((Ok(body.slice(sent..end)), end))
        }
    })
    .boxed()
}

impl Transport for MemoryTransport {
    fn head<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<HeadResponse, TransportError>> {
        Box::pin(async move {
            self.record(RequestMethod::Head, url, 0);
            let resource = self.connect("HEAD", url)?;
            if let Some(status) = resource.head_status {
                return Err(TransportError::Status {
                    method: "HEAD",
                    url: url.to_string(),
                    status,
                });
            }
            Ok(HeadResponse {
                content_length: resource.length(),
                accepts_ranges: !resource.ignore_range,
            })
        })
    }

    fn fetch<'a>(
        &'a self,
        url: &'a Url,
        offset: u64,
    ) -> BoxFuture<'a, Result<BodyResponse, TransportError>> {
        Box::pin(async move {
            self.record(RequestMethod::Get, url, offset);
            let resource = self.connect("GET", url)?;
            let full_len = resource.body.len() as u64;

            if offset == 0 || resource.ignore_range {
                let body = body_stream(&resource, url, resource.body.clone());
                return Ok(BodyResponse {
                    status: 200,
                    content_length: resource.length(),
                    content_range: None,
                    body,
                });
            }

            if offset >= full_len {
                return Err(TransportError::RangeNotSatisfiable {
                    url: url.to_string(),
                    complete_length: resource.length(),
                });
            }

            let slice = resource.body.slice(offset as usize..);
            let content_range = match resource.length() {
                Some(total) => ContentRange::parse(&ContentRange::header_value(offset, total)),
                None => Some(ContentRange {
                    start: offset,
                    end: full_len - 1,
                    complete_length: None,
                }),
            };
            let content_length = (!resource.hide_length).then_some(slice.len() as u64);
            let body = body_stream(&resource, url, slice);

            Ok(BodyResponse {
                status: 206,
                content_length,
                content_range,
                body,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    const URL: &str = "https://example.com/1.tar.lz4";

    async fn collect(body: BodyStream) -> Result<Vec<u8>, TransportError> {
        let pieces: Vec<Bytes> = body.try_collect().await?;
        Ok(pieces.concat())
    }

    #[tokio::test]
    async fn test_head_reports_length() {
        let transport = MemoryTransport::new();
        transport.insert(URL, MemoryResource::new(vec![1u8; 100]));
        let url = Url::parse(URL).unwrap();

        let head = transport.head(&url).await.unwrap();
        assert_eq!(head.content_length, Some(100));
        assert!(head.accepts_ranges);
    }

    #[tokio::test]
    async fn test_fetch_range() {
        let transport = MemoryTransport::new();
        let data: Vec<u8> = (0..100u8).collect();
        transport.insert(URL, MemoryResource::new(data.clone()).with_piece_size(7));
        let url = Url::parse(URL).unwrap();

        let response = transport.fetch(&url, 40).await.unwrap();
        assert_eq!(response.status, 206);
        assert_eq!(response.content_length, Some(60));
        assert_eq!(response.content_range.unwrap().start, 40);
        assert_eq!(collect(response.body).await.unwrap(), data[40..].to_vec());
        assert_eq!(transport.get_offsets(URL), vec![40]);
    }

    #[tokio::test]
    async fn test_ignored_range_returns_full_body() {
        let transport = MemoryTransport::new();
        transport.insert(URL, MemoryResource::new(vec![3u8; 50]).ignoring_range());
        let url = Url::parse(URL).unwrap();

        let response = transport.fetch(&url, 10).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(collect(response.body).await.unwrap().len(), 50);
    }

    #[tokio::test]
    async fn test_disconnect_breaks_stream_once() {
        let transport = MemoryTransport::new();
        transport.insert(
            URL,
            MemoryResource::new(vec![9u8; 64])
                .with_piece_size(10)
                .with_disconnects(25, 1),
        );
        let url = Url::parse(URL).unwrap();

        let response = transport.fetch(&url, 0).await.unwrap();
        let pieces: Vec<_> = response.body.collect().await;
        let received: usize = pieces
            .iter()
            .filter_map(|p| p.as_ref().ok())
            .map(|b| b.len())
            .sum();
        assert_eq!(received, 25);
        assert!(pieces.last().unwrap().is_err());

        let response = transport.fetch(&url, 25).await.unwrap();
        assert_eq!(collect(response.body).await.unwrap().len(), 39);
    }

    #[tokio::test]
    async fn test_refused_connections() {
        let transport = MemoryTransport::new();
        transport.insert(URL, MemoryResource::new(vec![0u8; 4]).with_refused_connections(1));
        let url = Url::parse(URL).unwrap();

        assert!(matches!(
            transport.head(&url).await,
            Err(TransportError::Connect { .. })
        ));
        assert!(transport.head(&url).await.is_ok());
    }

    #[tokio::test]
    async fn test_range_past_end_is_unsatisfiable() {
        let transport = MemoryTransport::new();
        transport.insert(URL, MemoryResource::new(vec![1u8; 40]));
        transport.insert("https://example.com/2.tar.lz4", MemoryResource::new(vec![1u8; 40]).without_length());
        let url = Url::parse(URL).unwrap();

        match transport.fetch(&url, 40).await {
            Err(TransportError::RangeNotSatisfiable { complete_length, .. }) => {
                assert_eq!(complete_length, Some(40))
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let hidden = Url::parse("https://example.com/2.tar.lz4").unwrap();
        match transport.fetch(&hidden, 40).await {
            Err(TransportError::RangeNotSatisfiable { complete_length, .. }) => {
                assert_eq!(complete_length, None)
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejected_head_still_serves_get() {
        let transport = MemoryTransport::new();
        transport.insert(URL, MemoryResource::new(vec![5u8; 12]).rejecting_head(405));
        let url = Url::parse(URL).unwrap();

        match transport.head(&url).await {
            Err(TransportError::Status { method, status, .. }) => {
                assert_eq!(method, "HEAD");
                assert_eq!(status, 405);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        let response = transport.fetch(&url, 0).await.unwrap();
        assert_eq!(collect(response.body).await.unwrap().len(), 12);
    }

    #[tokio::test]
    async fn test_unknown_resource_is_404() {
        let transport = MemoryTransport::new();
        let url = Url::parse(URL).unwrap();
        match transport.head(&url).await {
            Err(TransportError::Status { status, .. }) => assert_eq!(status, 404),
            other => panic!("unexpected result: {:?}", other),
        }
    }
}
