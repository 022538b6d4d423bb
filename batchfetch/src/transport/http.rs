//! HTTP transport backed by reqwest.
//!
//! Bodies are streamed chunk by chunk into the destination file, so memory
//! use stays flat regardless of resource size.

use std::path::Path;

use reqwest::header::RANGE;
use reqwest::{Client, RequestBuilder, StatusCode};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;

use super::{BoxFuture, GetResponse, HeadResponse, Transport, TransportRequest};
use crate::error::TransportError;

/// reqwest-based [`Transport`].
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Create a transport with a default reqwest client.
    ///
    /// Timeouts are applied per request from [`TransportRequest::timeout`].
    pub fn new() -> Result<Self, TransportError> {
        let client = Client::builder()
            .build()
            .map_err(|e| TransportError::Network {
                uri: String::new(),
                reason: format!("failed to create HTTP client: {}", e),
            })?;
        Ok(Self { client })
    }

    /// Create a transport around an existing client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn prepare(&self, builder: RequestBuilder, request: &TransportRequest) -> RequestBuilder {
        let mut builder = builder.timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(range) = request.range {
            builder = builder.header(RANGE, range.header_value());
        }
        builder
    }

    async fn do_head(&self, request: &TransportRequest) -> Result<HeadResponse, TransportError> {
        let response = self
            .prepare(self.client.head(&request.uri), request)
            .send()
            .await
            .map_err(|e| map_reqwest_error(request, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Status {
                uri: request.uri.clone(),
                status: status.as_u16(),
            });
        }

        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        Ok(HeadResponse {
            status: status.as_u16(),
            headers,
        })
    }

    async fn do_get(
        &self,
        request: &TransportRequest,
        dest: &Path,
        append: bool,
    ) -> Result<GetResponse, TransportError> {
        let mut response = self
            .prepare(self.client.get(&request.uri), request)
            .send()
            .await
            .map_err(|e| map_reqwest_error(request, e))?;

        // A server that ignores Range answers 200 with the whole body;
        // appending that would corrupt the file.
        let status = response.status();
        match request.range {
            Some(range) if status != StatusCode::PARTIAL_CONTENT => {
                if status.is_success() {
                    return Err(TransportError::RangeNotHonored {
                        uri: request.uri.clone(),
                        range: range.header_value(),
                    });
                }
                return Err(TransportError::Status {
                    uri: request.uri.clone(),
                    status: status.as_u16(),
                });
            }
            None if !status.is_success() => {
                return Err(TransportError::Status {
                    uri: request.uri.clone(),
                    status: status.as_u16(),
                });
            }
            _ => {}
        }

        let file = open_destination(dest, append).await?;
        let mut writer = BufWriter::new(file);
        let mut bytes_written = 0u64;

        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| map_reqwest_error(request, e))?
        {
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| TransportError::io(dest, &e))?;
            bytes_written += chunk.len() as u64;
        }

        writer
            .flush()
            .await
            .map_err(|e| TransportError::io(dest, &e))?;

        debug!(
            uri = %request.uri,
            bytes = bytes_written,
            status = status.as_u16(),
            "GET complete"
        );

        Ok(GetResponse {
            status: status.as_u16(),
            bytes_written,
        })
    }
}

impl Transport for HttpTransport {
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

/// Open the destination for writing, creating parent directories.
pub(super) async fn open_destination(dest: &Path, append: bool) -> Result<File, TransportError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|e| TransportError::io(parent, &e))?;
    }

    let result = if append {
        OpenOptions::new().create(true).append(true).open(dest).await
    } else {
        File::create(dest).await
    };
    result.map_err(|e| TransportError::io(dest, &e))
}

fn map_reqwest_error(request: &TransportRequest, err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout {
            uri: request.uri.clone(),
            timeout_secs: request.timeout.as_secs(),
        }
    } else if let Some(status) = err.status() {
        TransportError::Status {
            uri: request.uri.clone(),
            status: status.as_u16(),
        }
    } else {
        TransportError::Network {
            uri: request.uri.clone(),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_http_transport_new() {
        assert!(HttpTransport::new().is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_network_error() {
        let transport = HttpTransport::new().unwrap();
        // Port 9 (discard) on localhost is closed in test environments.
        let request = TransportRequest::new(
            "http://127.0.0.1:9/missing.bin",
            Vec::new(),
            Duration::from_secs(2),
        );

        let result = transport.head(&request).await;
        assert!(matches!(
            result,
            Err(TransportError::Network { .. }) | Err(TransportError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn test_open_destination_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("nested").join("file.bin");

        let mut file = open_destination(&dest, false).await.unwrap();
        file.write_all(b"abc").await.unwrap();
        file.flush().await.unwrap();
        drop(file);

        let mut file = open_destination(&dest, true).await.unwrap();
        file.write_all(b"def").await.unwrap();
        file.flush().await.unwrap();
        drop(file);

        assert_eq!(std::fs::read(&dest).unwrap(), b"abcdef");
    }
}
