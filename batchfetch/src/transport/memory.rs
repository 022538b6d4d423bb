//! In-process transport serving resources from memory.
//!
//! Behaves like a small HTTP server: HEAD reports `Content-Length` and
//! `Accept-Ranges`, ranged GETs return the requested slice, and each
//! resource can be configured to reject HEAD, ignore ranges, fail with a
//! status, or block until released. Every request is recorded so callers can
//! assert on exactly what was sent.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

use super::http::open_destination;
use super::{BoxFuture, ByteRange, GetResponse, HeadResponse, Transport, TransportRequest};
use crate::error::TransportError;

/// A resource served by [`MemoryTransport`].
#[derive(Debug, Clone)]
pub struct MemoryResource {
    /// Body bytes.
    pub body: Bytes,
    /// Answer HEAD requests (otherwise 405).
    pub head_supported: bool,
    /// Advertise and honor byte ranges.
    pub ranges_supported: bool,
    /// Status returned for every GET instead of the body.
    pub fail_status: Option<u16>,
    /// Fail only the n-th GET (1-based) with status 500.
    pub fail_on_get: Option<usize>,
    /// Artificial latency per request.
    pub latency: Duration,
}

impl MemoryResource {
    /// A range-capable resource with the given body.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            head_supported: true,
            ranges_supported: true,
            fail_status: None,
            fail_on_get: None,
            latency: Duration::ZERO,
        }
    }

    /// A resource of `len` bytes with a repeating byte pattern.
    pub fn sized(len: usize) -> Self {
        Self::new((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
    }

    /// A resource whose every GET fails with `status`.
    pub fn failing(status: u16) -> Self {
        Self {
            fail_status: Some(status),
            ..Self::new(Bytes::new())
        }
    }

    /// Reject HEAD requests with 405.
    pub fn without_head(mut self) -> Self {
        self.head_supported = false;
        self
    }

    /// Do not advertise or honor byte ranges.
    pub fn without_ranges(mut self) -> Self {
        self.ranges_supported = false;
        self
    }

    /// Fail the n-th GET (1-based) with status 500.
    pub fn fail_on_get(mut self, n: usize) -> Self {
        self.fail_on_get = Some(n);
        self
    }

    /// Delay every response.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }
}

/// A request observed by [`MemoryTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    /// `"HEAD"` or `"GET"`.
    pub method: &'static str,
    /// Requested URI.
    pub uri: String,
    /// Requested byte range, if any.
    pub range: Option<ByteRange>,
}

struct Entry {
    resource: MemoryResource,
    gets_served: usize,
    gate: Option<watch::Sender<bool>>,
}

/// [`Transport`] serving [`MemoryResource`]s.
#[derive(Default)]
pub struct MemoryTransport {
    entries: Mutex<HashMap<String, Entry>>,
    log: Mutex<Vec<RecordedRequest>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("resources", &self.entries.lock().len())
            .field("in_flight", &self.in_flight.load(Ordering::SeqCst))
            .finish()
    }
}

impl MemoryTransport {
    /// Create an empty transport. Unknown URIs answer 404.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `resource` at `uri`, replacing any previous resource.
    pub fn insert(&self, uri: impl Into<String>, resource: MemoryResource) {
        self.entries.lock().insert(
            uri.into(),
            Entry {
                resource,
                gets_served: 0,
                gate: None,
            },
        );
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with_resource(self, uri: impl Into<String>, resource: MemoryResource) -> Self {
        self.insert(uri, resource);
        self
    }

    /// Make GET requests for `uri` wait until [`release`](Self::release)
    /// is called.
    pub fn hold(&self, uri: &str) {
        if let Some(entry) = self.entries.lock().get_mut(uri) {
            let (tx, _rx) = watch::channel(false);
            entry.gate = Some(tx);
        }
    }

    /// Let held GET requests for `uri` proceed.
    pub fn release(&self, uri: &str) {
        if let Some(entry) = self.entries.lock().get_mut(uri) {
            if let Some(gate) = entry.gate.take() {
                gate.send_replace(true);
            }
        }
    }

    /// Every request received so far, in arrival order.
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.log.lock().clone()
    }

    /// Requests received for one URI.
    pub fn requests_for(&self, uri: &str) -> Vec<RecordedRequest> {
        self.log
            .lock()
            .iter()
            .filter(|r| r.uri == uri)
            .cloned()
            .collect()
    }

    /// Number of requests currently being served.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of requests ever served at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn record(&self, method: &'static str, request: &TransportRequest) {
        self.log.lock().push(RecordedRequest {
            method,
            uri: request.uri.clone(),
            range: request.range,
        });
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(&self.in_flight)
    }

    async fn do_head(&self, request: &TransportRequest) -> Result<HeadResponse, TransportError> {
        self.record("HEAD", request);
        let _guard = self.enter();

        let resource = self
            .entries
            .lock()
            .get(&request.uri)
            .map(|e| e.resource.clone());
        let resource = resource.ok_or_else(|| not_found(request))?;

        if !resource.latency.is_zero() {
            tokio::time::sleep(resource.latency).await;
        }
        if !resource.head_supported {
            return Err(TransportError::Status {
                uri: request.uri.clone(),
                status: 405,
            });
        }

        let mut headers = HashMap::new();
        headers.insert(
            "content-length".to_string(),
            resource.body.len().to_string(),
        );
        if resource.ranges_supported {
            headers.insert("accept-ranges".to_string(), "bytes".to_string());
        }
        Ok(HeadResponse {
            status: 200,
            headers,
        })
    }

    async fn do_get(
        &self,
        request: &TransportRequest,
        dest: &Path,
        append: bool,
    ) -> Result<GetResponse, TransportError> {
        self.record("GET", request);
        let _guard = self.enter();

        let (resource, serial, gate) = {
            let mut entries = self.entries.lock();
            let entry = entries
                .get_mut(&request.uri)
                .ok_or_else(|| not_found(request))?;
            entry.gets_served += 1;
            (
                entry.resource.clone(),
                entry.gets_served,
                entry.gate.as_ref().map(|g| g.subscribe()),
            )
        };

        if let Some(mut gate) = gate {
            // A dropped sender means the gate was released.
            let _ = gate.wait_for(|open| *open).await;
        }
        if !resource.latency.is_zero() {
            tokio::time::sleep(resource.latency).await;
        }

        if let Some(status) = resource.fail_status {
            return Err(TransportError::Status {
                uri: request.uri.clone(),
                status,
            });
        }
        if resource.fail_on_get == Some(serial) {
            return Err(TransportError::Status {
                uri: request.uri.clone(),
                status: 500,
            });
        }

        let (status, body) = match request.range {
            None => (200, resource.body.clone()),
            Some(range) if !resource.ranges_supported => {
                return Err(TransportError::RangeNotHonored {
                    uri: request.uri.clone(),
                    range: range.header_value(),
                });
            }
            Some(range) => {
                let len = resource.body.len() as u64;
                if range.start >= len {
                    return Err(TransportError::Status {
                        uri: request.uri.clone(),
                        status: 416,
                    });
                }
                let end = range.end.min(len - 1);
                (
                    206,
                    resource.body.slice(range.start as usize..=end as usize),
                )
            }
        };

        let mut file = open_destination(dest, append).await?;
        file.write_all(&body)
            .await
            .map_err(|e| TransportError::io(dest, &e))?;
        file.flush()
            .await
            .map_err(|e| TransportError::io(dest, &e))?;

        Ok(GetResponse {
            status,
            bytes_written: body.len() as u64,
        })
    }
}

/// Decrements the in-flight counter on drop.
struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn not_found(request: &TransportRequest) -> TransportError {
    TransportError::Status {
        uri: request.uri.clone(),
        status: 404,
    }
}

impl Transport for MemoryTransport {
    fn head<'a>(
        &'a self,
        request: &'a TransportRequest,
    ) -> BoxFuture<'a, Result<HeadResponse, TransportError>> {
        Box::pin(self.do_head(request))
    }

    fn get_range<'a>(
        &'a self,
        request: &'a TransportRequest,
        dest: &'a Path,
        append: bool,
    ) -> BoxFuture<'a, Result<GetResponse, TransportError>> {
        Box::pin(self.do_get(request, dest, append))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const URI: &str = "http://mem/a.bin";

    fn request() -> TransportRequest {
        TransportRequest::new(URI, Vec::new(), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_head_reports_length_and_ranges() {
        let transport = MemoryTransport::new().with_resource(URI, MemoryResource::sized(1000));

        let response = transport.head(&request()).await.unwrap();
        assert_eq!(response.content_length(), Some(1000));
        assert!(response.accepts_byte_ranges());
    }

    #[tokio::test]
    async fn test_head_unsupported() {
        let transport =
            MemoryTransport::new().with_resource(URI, MemoryResource::sized(10).without_head());

        let err = transport.head(&request()).await.unwrap_err();
        assert_eq!(err.code(), 405);
    }

    #[tokio::test]
    async fn test_ranged_get_appends_slice() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.bin");
        let resource = MemoryResource::sized(10);
        let body = resource.body.clone();
        let transport = MemoryTransport::new().with_resource(URI, resource);

        let first = request().with_range(ByteRange::from_len(0, 4));
        let second = request().with_range(ByteRange::from_len(4, 6));
        transport.get_range(&first, &dest, true).await.unwrap();
        let response = transport.get_range(&second, &dest, true).await.unwrap();

        assert_eq!(response.status, 206);
        assert_eq!(response.bytes_written, 6);
        assert_eq!(std::fs::read(&dest).unwrap(), body.to_vec());
        assert_eq!(transport.requests().len(), 2);
    }

    #[tokio::test]
    async fn test_range_ignored_when_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let transport =
            MemoryTransport::new().with_resource(URI, MemoryResource::sized(10).without_ranges());

        let ranged = request().with_range(ByteRange::from_len(0, 4));
        let err = transport
            .get_range(&ranged, &dir.path().join("a.bin"), true)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::RangeNotHonored { .. }));
    }

    #[tokio::test]
    async fn test_fail_on_nth_get() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.bin");
        let transport =
            MemoryTransport::new().with_resource(URI, MemoryResource::sized(10).fail_on_get(2));

        assert!(transport.get_range(&request(), &dest, false).await.is_ok());
        assert!(transport.get_range(&request(), &dest, false).await.is_err());
        assert!(transport.get_range(&request(), &dest, false).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_uri_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let transport = MemoryTransport::new();
        let err = transport
            .get_range(&request(), &dir.path().join("a.bin"), false)
            .await
            .unwrap_err();
        assert_eq!(err.code(), 404);
    }

    #[tokio::test]
    async fn test_hold_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.bin");
        let transport =
            Arc::new(MemoryTransport::new().with_resource(URI, MemoryResource::sized(4)));
        transport.hold(URI);

        let t = Arc::clone(&transport);
        let handle = tokio::spawn(async move {
            let req = request();
            t.get_range(&req, &dest, false).await
        });

        while transport.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(!handle.is_finished());

        transport.release(URI);
        assert!(handle.await.unwrap().is_ok());
        assert_eq!(transport.peak_in_flight(), 1);
    }
}
