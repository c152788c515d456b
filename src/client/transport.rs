//! Moves one file to the backend's `/upload` endpoint.
//!
//! The body is fed to `reqwest` as a stream of chunks so byte-level progress
//! can be reported while the request is being written.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use pin_project_lite::pin_project;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::debug;

use super::task::{FileRef, FALLBACK_CONTENT_TYPE};
use super::ClientError;
use crate::config::ClientConfig;

/// Called with `(bytes_sent, total_bytes)` as the body is written.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Sends a file and returns the object's public URL.
pub trait UploadTransport: Send + Sync + 'static {
    fn upload<'a>(
        &'a self,
        file: &'a FileRef,
        bucket: &'a str,
        on_progress: ProgressFn,
    ) -> Pin<Box<dyn Future<Output = Result<String, ClientError>> + Send + 'a>>;
}

pin_project! {
    /// Body stream that reports cumulative bytes handed to the transport.
    pub struct ProgressStream<S> {
        #[pin]
        inner: S,
        sent: u64,
        total: u64,
        on_progress: ProgressFn,
    }
}

impl<S> ProgressStream<S> {
    pub fn new(inner: S, total: u64, on_progress: ProgressFn) -> Self {
        Self {
            inner,
            sent: 0,
            total,
            on_progress,
        }
    }
}

impl<S> Stream for ProgressStream<S>
where
    S: Stream<Item = io::Result<Bytes>>,
{
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        match this.inner.poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                if !chunk.is_empty() {
                    *this.sent += chunk.len() as u64;
                    (this.on_progress)(*this.sent, *this.total);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }
}

/// Split `data` into `chunk_size` pieces without copying.
fn chunked(data: Bytes, chunk_size: usize) -> impl Stream<Item = io::Result<Bytes>> {
    let chunk_size = chunk_size.max(1);
    let len = data.len();
    futures::stream::iter(
        (0..len)
            .step_by(chunk_size)
            .map(move |start| Ok(data.slice(start..(start + chunk_size).min(len)))),
    )
}

/// Derive the upload endpoint from a backend base URL.
///
/// A base already ending in `/upload` is used as is; otherwise one trailing
/// slash is trimmed and `/upload` appended.
pub fn endpoint_url(base: &str) -> Result<String, ClientError> {
    let base = base.trim();
    if base.is_empty() {
        return Err(ClientError::InvalidEndpoint(
            "backend URL is empty".to_string(),
        ));
    }
    if !base.starts_with("http://") && !base.starts_with("https://") {
        return Err(ClientError::InvalidEndpoint(base.to_string()));
    }
    if base.ends_with("/upload") {
        return Ok(base.to_string());
    }
    Ok(format!("{}/upload", base.strip_suffix('/').unwrap_or(base)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SuccessBody {
    public_url: String,
}

#[derive(Debug, Deserialize)]
struct FailureBody {
    message: Option<String>,
}

/// Turn the backend's status and body into the upload outcome.
pub fn interpret_response(status: u16, body: &str) -> Result<String, ClientError> {
    if (200..300).contains(&status) {
        return serde_json::from_str::<SuccessBody>(body)
            .map(|b| b.public_url)
            .map_err(|e| {
                debug!("Unparsable upload response: {}", e);
                ClientError::MalformedResponse
            });
    }
    let message = serde_json::from_str::<FailureBody>(body)
        .ok()
        .and_then(|b| b.message)
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| "Upload failed".to_string());
    Err(ClientError::server_reported(status, message))
}

/// HTTP transport posting multipart forms with `reqwest`.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    chunk_size: usize,
}

impl HttpTransport {
    pub fn new(backend_base_url: &str, config: &ClientConfig) -> Result<Self, ClientError> {
        let endpoint = endpoint_url(backend_base_url)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ClientError::InvalidEndpoint(e.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            chunk_size: config.chunk_size,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn file_part(&self, file: &FileRef, on_progress: ProgressFn) -> Part {
        let stream = ProgressStream::new(
            chunked(file.data.clone(), self.chunk_size),
            file.size(),
            on_progress,
        );
        let content_type = HeaderValue::from_str(&file.content_type)
            .ok()
            .filter(|_| file.content_type.contains('/'))
            .unwrap_or_else(|| HeaderValue::from_static(FALLBACK_CONTENT_TYPE));
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, content_type);

        Part::stream_with_length(reqwest::Body::wrap_stream(stream), file.size())
            .file_name(file.name.clone())
            .headers(headers)
    }

    async fn send(
        &self,
        file: &FileRef,
        bucket: &str,
        on_progress: ProgressFn,
    ) -> Result<String, ClientError> {
        let form = Form::new()
            .part("file", self.file_part(file, on_progress))
            .text("bucketName", bucket.to_string());

        let resp = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await?;
        let status = resp.status().as_u16();
        let body = resp.text().await?;
        debug!("Upload of {} answered HTTP {}", file.name, status);
        interpret_response(status, &body)
    }
}

impl UploadTransport for HttpTransport {
    fn upload<'a>(
        &'a self,
        file: &'a FileRef,
        bucket: &'a str,
        on_progress: ProgressFn,
    ) -> Pin<Box<dyn Future<Output = Result<String, ClientError>> + Send + 'a>> {
        Box::pin(self.send(file, bucket, on_progress))
    }
}
