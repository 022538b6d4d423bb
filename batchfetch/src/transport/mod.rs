//! Transport abstraction for issuing HEAD and (ranged) GET requests.
//!
//! The orchestrator never talks to the network directly. It is generic over
//! a [`Transport`], which:
//!
//! - answers HEAD requests with status and response headers
//! - performs GET requests, optionally restricted to a byte range, writing
//!   the body to a destination path (truncating, or appending for ranges)
//!
//! Two implementations ship with the crate:
//!
//! - [`HttpTransport`] - reqwest-backed, streams bodies to disk with tokio fs
//! - [`MemoryTransport`] - serves in-process resources; used by tests and
//!   for exercising failure policies without a server
//!
//! # Dyn Compatibility
//!
//! Methods return [`BoxFuture`] so the trait stays object safe
//! (`Arc<dyn Transport>` works as well as a concrete type).

mod http;
mod memory;

pub use http::HttpTransport;
pub use memory::{MemoryResource, MemoryTransport, RecordedRequest};

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::time::Duration;

use crate::config::RequestHeaders;
use crate::error::TransportError;

/// Boxed future type for dyn-compatible async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An inclusive byte span, rendered as `bytes=start-end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte offset.
    pub start: u64,
    /// Last byte offset (inclusive).
    pub end: u64,
}

impl ByteRange {
    /// A range of `len` bytes starting at `start`.
    ///
    /// `len` must be non-zero.
    pub fn from_len(start: u64, len: u64) -> Self {
        debug_assert!(len > 0, "empty byte range");
        Self {
            start,
            end: start + len - 1,
        }
    }

    /// Number of bytes covered.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always false; a `ByteRange` covers at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Value for the `Range` request header.
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// A request as handed to the transport.
#[derive(Debug, Clone)]
pub struct TransportRequest {
    /// Resource URI.
    pub uri: String,
    /// Headers to send.
    pub headers: RequestHeaders,
    /// Overall request timeout.
    pub timeout: Duration,
    /// Byte span to request; `None` fetches the whole resource.
    pub range: Option<ByteRange>,
}

impl TransportRequest {
    /// A whole-resource request.
    pub fn new(uri: impl Into<String>, headers: RequestHeaders, timeout: Duration) -> Self {
        Self {
            uri: uri.into(),
            headers,
            timeout,
            range: None,
        }
    }

    /// Restrict the request to a byte span.
    pub fn with_range(mut self, range: ByteRange) -> Self {
        self.range = Some(range);
        self
    }
}

/// Response to a HEAD request.
#[derive(Debug, Clone, Default)]
pub struct HeadResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response headers, names lowercased.
    pub headers: HashMap<String, String>,
}

impl HeadResponse {
    /// Look up a header by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Parsed `Content-Length`, if present and numeric.
    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")
            .and_then(|v| v.trim().parse::<u64>().ok())
    }

    /// True if the server advertises `Accept-Ranges: bytes`.
    pub fn accepts_byte_ranges(&self) -> bool {
        self.header("accept-ranges")
            .map(|v| v.trim().eq_ignore_ascii_case("bytes"))
            .unwrap_or(false)
    }
}

/// Response to a GET request whose body was written to disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct GetResponse {
    /// HTTP status code.
    pub status: u16,
    /// Number of body bytes written by this request.
    pub bytes_written: u64,
}

/// Capability for issuing requests on behalf of the orchestrator.
///
/// Implementations must be `Send + Sync`; the orchestrator shares one
/// transport across all concurrent transfers.
pub trait Transport: Send + Sync + 'static {
    /// Issue a HEAD request.
    ///
    /// Any non-2xx status is returned as [`TransportError::Status`].
    fn head<'a>(
        &'a self,
        request: &'a TransportRequest,
    ) -> BoxFuture<'a, Result<HeadResponse, TransportError>>;

    /// Issue a GET request and write the body to `dest`.
    ///
    /// With `append` set the body is appended to an existing file (used for
    /// chunked transfers); otherwise the file is created or truncated.
    /// When `request.range` is set the implementation must either deliver
    /// exactly that span or fail with [`TransportError::RangeNotHonored`].
    fn get_range<'a>(
        &'a self,
        request: &'a TransportRequest,
        dest: &'a Path,
        append: bool,
    ) -> BoxFuture<'a, Result<GetResponse, TransportError>>;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn head<'a>(
        &'a self,
        request: &'a TransportRequest,
    ) -> BoxFuture<'a, Result<HeadResponse, TransportError>> {
        (**self).head(request)
    }

    fn get_range<'a>(
        &'a self,
        request: &'a TransportRequest,
        dest: &'a Path,
        append: bool,
    ) -> BoxFuture<'a, Result<GetResponse, TransportError>> {
        (**self).get_range(request, dest, append)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_range_inclusive() {
        let range = ByteRange::from_len(100, 50);
        assert_eq!(range.start, 100);
        assert_eq!(range.end, 149);
        assert_eq!(range.len(), 50);
        assert_eq!(range.header_value(), "bytes=100-149");
    }

    #[test]
    fn test_head_response_headers_case_insensitive() {
        let mut headers = HashMap::new();
        headers.insert("content-length".to_string(), "2048".to_string());
        headers.insert("accept-ranges".to_string(), "Bytes".to_string());
        let response = HeadResponse {
            status: 200,
            headers,
        };

        assert_eq!(response.header("Content-Length"), Some("2048"));
        assert_eq!(response.content_length(), Some(2048));
        assert!(response.accepts_byte_ranges());
    }

    #[test]
    fn test_head_response_missing_headers() {
        let response = HeadResponse {
            status: 200,
            headers: HashMap::new(),
        };
        assert_eq!(response.content_length(), None);
        assert!(!response.accepts_byte_ranges());
    }

    #[test]
    fn test_accept_ranges_none() {
        let mut headers = HashMap::new();
        headers.insert("accept-ranges".to_string(), "none".to_string());
        let response = HeadResponse {
            status: 200,
            headers,
        };
        assert!(!response.accepts_byte_ranges());
    }
}
