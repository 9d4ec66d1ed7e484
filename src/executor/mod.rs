//! Request executor boundary
//!
//! The pool never speaks HTTP itself. Each job is handed to a fresh
//! [`RequestExecutor`] created by an [`ExecutorFactory`]; the executor performs
//! one transfer, optionally streaming body chunks into a [`BodySink`], and
//! exposes what it learned about the transfer afterwards.

pub mod http;
pub mod scripted;

pub use http::{HttpConfig, HttpExecutor, HttpExecutorFactory};
pub use scripted::{Script, ScriptedExecutor, ScriptedFactory};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode, Version};
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Failures surfaced by an executor while configuring or performing a transfer
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransferError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("transfer timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("too many redirects")]
    TooManyRedirects,

    #[error("request failed: {0}")]
    Request(String),

    #[error("failed to read body: {0}")]
    Body(String),

    #[error("request not configured: {0}")]
    Configuration(String),

    /// Process-level shutdown. Never recorded on a job.
    #[error("transfer interrupted")]
    Interrupted,
}

impl TransferError {
    pub fn is_interrupt(&self) -> bool {
        matches!(self, TransferError::Interrupted)
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;

/// What to fetch. Built by a job's configurator before `perform`.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    pub url: String,
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    pub timeout: Option<Duration>,
}

impl Default for RequestSpec {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: Method::GET,
            headers: Vec::new(),
            body: None,
            timeout: None,
        }
    }
}

impl RequestSpec {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn header(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Receives body chunks as they arrive.
///
/// Returning fewer bytes than supplied tells the executor to stop delivering
/// chunks. The transfer itself keeps running to completion.
pub trait BodySink: Send {
    fn on_chunk(&mut self, chunk: &[u8]) -> usize;
}

/// Transfer facts readable after `perform`, whether it succeeded or not.
///
/// Fields the transfer never reached stay `None`/zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TransferInfo {
    pub total_time: Duration,
    pub redirect_time: Option<Duration>,
    pub dns_lookup_time: Option<Duration>,
    pub effective_url: Option<String>,
    pub status: Option<u16>,
    /// Bytes per second over the whole transfer
    pub download_speed: f64,
    pub bytes_downloaded: u64,
}

/// Underlying response handle kept on the job result for inspection
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub version: Version,
    pub headers: HeaderMap,
    pub remote_addr: Option<SocketAddr>,
}

/// One transfer. Created fresh per job, never reused.
#[async_trait]
pub trait RequestExecutor: Send {
    /// Apply the job's request configuration
    fn configure(&mut self, spec: RequestSpec) -> Result<()>;

    /// Drive the transfer to completion or failure.
    ///
    /// With a sink, body chunks are handed to it and `body()` stays empty.
    async fn perform(&mut self, sink: Option<&mut dyn BodySink>) -> Result<()>;

    /// Raw response header block (status line plus headers)
    fn head(&self) -> Bytes;

    /// Body buffered by the executor; only meaningful without a sink
    fn body(&self) -> Bytes;

    fn info(&self) -> TransferInfo;

    fn raw_response(&self) -> Option<RawResponse>;
}

/// Produces a fresh executor for every job
pub trait ExecutorFactory: Send + Sync {
    fn create(&self) -> Box<dyn RequestExecutor>;
}

impl<F> ExecutorFactory for F
where
    F: Fn() -> Box<dyn RequestExecutor> + Send + Sync,
{
    fn create(&self) -> Box<dyn RequestExecutor> {
        self()
    }
}

/// Render a status line and header map as the raw header block
pub(crate) fn render_head(status: StatusCode, version: Version, headers: &HeaderMap) -> Bytes {
    let mut head = format!(
        "{:?} {} {}\r\n",
        version,
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    )
    .into_bytes();

    for (name, value) in headers {
        head.extend_from_slice(name.as_str().as_bytes());
        head.extend_from_slice(b": ");
        head.extend_from_slice(value.as_bytes());
        head.extend_from_slice(b"\r\n");
    }
    head.extend_from_slice(b"\r\n");

    Bytes::from(head)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{CONTENT_TYPE, HeaderValue};

    #[test]
    fn test_render_head() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));

        let head = render_head(StatusCode::NOT_FOUND, Version::HTTP_11, &headers);
        assert_eq!(
            &head[..],
            b"HTTP/1.1 404 Not Found\r\ncontent-type: text/plain\r\n\r\n"
        );
    }

    #[test]
    fn test_only_interrupt_is_signal_class() {
        assert!(TransferError::Interrupted.is_interrupt());
        assert!(!TransferError::Timeout.is_interrupt());
        assert!(!TransferError::Connect("refused".into()).is_interrupt());
    }

    #[test]
    fn test_request_spec_builder() {
        let mut spec = RequestSpec::get("http://example.com/a");
        spec.header("accept", "*/*");
        assert_eq!(spec.method, Method::GET);
        assert_eq!(spec.headers, vec![("accept".to_string(), "*/*".to_string())]);
    }
}
