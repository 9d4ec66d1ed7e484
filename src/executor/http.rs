//! reqwest-backed executor: the production transport

use super::{
    BodySink, ExecutorFactory, RawResponse, RequestExecutor, RequestSpec, Result, TransferError,
    TransferInfo, render_head,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::{Client, Proxy, Url};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// HTTP client configuration shared by every executor of a pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpConfig {
    pub connect_timeout: Duration,
    /// Whole-transfer timeout. `None` leaves hung transfers to the server.
    pub request_timeout: Option<Duration>,
    pub user_agent: String,
    pub max_redirects: usize,
    pub proxy: Option<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Some(Duration::from_secs(60)),
            user_agent: concat!("fetchpool/", env!("CARGO_PKG_VERSION")).to_string(),
            max_redirects: 10,
            proxy: None,
        }
    }
}

impl HttpConfig {
    /// Build the shared client. Connection pooling, DNS and TLS live in here.
    pub fn build_client(&self) -> Result<Client> {
        let mut builder = Client::builder()
            .connect_timeout(self.connect_timeout)
            .user_agent(&self.user_agent)
            .redirect(reqwest::redirect::Policy::limited(self.max_redirects));

        if let Some(timeout) = self.request_timeout {
            builder = builder.timeout(timeout);
        }

        if let Some(url) = &self.proxy {
            let proxy = Proxy::all(url)
                .map_err(|e| TransferError::InvalidUrl(format!("invalid proxy {url}: {e}")))?;
            builder = builder.proxy(proxy);
        }

        builder
            .build()
            .map_err(|e| TransferError::Configuration(e.to_string()))
    }
}

/// Hands out executors sharing one connection pool
#[derive(Debug, Clone)]
pub struct HttpExecutorFactory {
    client: Client,
}

impl HttpExecutorFactory {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        Ok(Self {
            client: config.build_client()?,
        })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

impl ExecutorFactory for HttpExecutorFactory {
    fn create(&self) -> Box<dyn RequestExecutor> {
        Box::new(HttpExecutor::new(self.client.clone()))
    }
}

/// Performs a single request with reqwest, streaming the body chunk by chunk
pub struct HttpExecutor {
    client: Client,
    spec: Option<RequestSpec>,
    head: Bytes,
    body: BytesMut,
    info: TransferInfo,
    raw: Option<RawResponse>,
}

impl HttpExecutor {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            spec: None,
            head: Bytes::new(),
            body: BytesMut::new(),
            info: TransferInfo::default(),
            raw: None,
        }
    }

    async fn transfer(
        &mut self,
        spec: RequestSpec,
        mut sink: Option<&mut dyn BodySink>,
    ) -> Result<()> {
        let url = Url::parse(&spec.url)
            .map_err(|e| TransferError::InvalidUrl(format!("{}: {}", spec.url, e)))?;

        debug!(url = %url, method = %spec.method, "Starting transfer");

        let mut request = self.client.request(spec.method.clone(), url);
        for (name, value) in &spec.headers {
            request = request.header(name, value);
        }
        if let Some(body) = spec.body {
            request = request.body(body);
        }
        if let Some(timeout) = spec.timeout {
            request = request.timeout(timeout);
        }

        let mut response = request.send().await.map_err(map_send_error)?;

        let status = response.status();
        self.head = render_head(status, response.version(), response.headers());
        self.info.status = Some(status.as_u16());
        self.info.effective_url = Some(response.url().to_string());
        self.raw = Some(RawResponse {
            status,
            version: response.version(),
            headers: response.headers().clone(),
            remote_addr: response.remote_addr(),
        });

        // A sink that stops consuming only stops delivery; the rest of the
        // body is still drained so the transfer finishes normally.
        let mut delivering = true;
        while let Some(chunk) = response.chunk().await.map_err(map_body_error)? {
            self.info.bytes_downloaded += chunk.len() as u64;
            match sink.as_mut() {
                Some(sink) if delivering => {
                    if sink.on_chunk(&chunk) < chunk.len() {
                        debug!(url = %response.url(), "Body sink stopped consuming");
                        delivering = false;
                    }
                }
                Some(_) => {}
                None => self.body.extend_from_slice(&chunk),
            }
        }

        debug!(
            url = %response.url(),
            status = status.as_u16(),
            bytes = self.info.bytes_downloaded,
            "Transfer completed"
        );

        Ok(())
    }
}

#[async_trait]
impl RequestExecutor for HttpExecutor {
    fn configure(&mut self, spec: RequestSpec) -> Result<()> {
        if spec.url.is_empty() {
            return Err(TransferError::Configuration("request has no URL".to_string()));
        }
        self.spec = Some(spec);
        Ok(())
    }

    async fn perform(&mut self, sink: Option<&mut dyn BodySink>) -> Result<()> {
        let spec = self
            .spec
            .clone()
            .ok_or_else(|| TransferError::Configuration("perform before configure".to_string()))?;

        let started = Instant::now();
        let outcome = self.transfer(spec, sink).await;

        self.info.total_time = started.elapsed();
        let secs = self.info.total_time.as_secs_f64();
        if secs > 0.0 {
            self.info.download_speed = self.info.bytes_downloaded as f64 / secs;
        }

        if let Err(e) = &outcome {
            warn!(
                url = self.spec.as_ref().map(|s| s.url.as_str()).unwrap_or_default(),
                error = %e,
                "Transfer failed"
            );
        }

        outcome
    }

    fn head(&self) -> Bytes {
        self.head.clone()
    }

    fn body(&self) -> Bytes {
        Bytes::copy_from_slice(&self.body)
    }

    fn info(&self) -> TransferInfo {
        self.info.clone()
    }

    fn raw_response(&self) -> Option<RawResponse> {
        self.raw.clone()
    }
}

fn map_send_error(e: reqwest::Error) -> TransferError {
    if e.is_timeout() {
        TransferError::Timeout
    } else if e.is_redirect() {
        TransferError::TooManyRedirects
    } else if e.is_connect() {
        TransferError::Connect(e.to_string())
    } else if e.is_builder() {
        // The URL was parsed already; what is left is the request the job built
        TransferError::Configuration(e.to_string())
    } else {
        TransferError::Request(e.to_string())
    }
}

fn map_body_error(e: reqwest::Error) -> TransferError {
    if e.is_timeout() {
        TransferError::Timeout
    } else {
        TransferError::Body(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_config_defaults() {
        let config = HttpConfig::default();
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
        assert_eq!(config.request_timeout, Some(Duration::from_secs(60)));
        assert_eq!(config.max_redirects, 10);
        assert!(config.user_agent.starts_with("fetchpool/"));
    }

    #[test]
    fn test_invalid_proxy_rejected() {
        let config = HttpConfig {
            proxy: Some("http://[not-an-address".to_string()),
            ..HttpConfig::default()
        };
        assert!(matches!(config.build_client(), Err(TransferError::InvalidUrl(_))));
    }

    #[test]
    fn test_socks_proxy_accepted() {
        let config = HttpConfig {
            proxy: Some("socks5h://127.0.0.1:1080".to_string()),
            ..HttpConfig::default()
        };
        assert!(config.build_client().is_ok());
    }

    #[tokio::test]
    async fn test_invalid_header_is_configuration_error() {
        let mut executor = HttpExecutor::new(Client::new());
        let mut spec = RequestSpec::get("http://127.0.0.1:9/");
        spec.header("bad header", "x");
        executor.configure(spec).unwrap();

        let err = executor.perform(None).await.unwrap_err();
        assert!(matches!(err, TransferError::Configuration(_)));
    }

    #[test]
    fn test_configure_requires_url() {
        let mut executor = HttpExecutor::new(Client::new());
        let err = executor.configure(RequestSpec::default()).unwrap_err();
        assert!(matches!(err, TransferError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_perform_before_configure() {
        let mut executor = HttpExecutor::new(Client::new());
        let err = executor.perform(None).await.unwrap_err();
        assert!(matches!(err, TransferError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_malformed_url_is_transfer_error() {
        let mut executor = HttpExecutor::new(Client::new());
        executor.configure(RequestSpec::get("not a url")).unwrap();
        let err = executor.perform(None).await.unwrap_err();
        assert!(matches!(err, TransferError::InvalidUrl(_)));
        assert!(executor.head().is_empty());
        assert_eq!(executor.info().status, None);
    }
}
