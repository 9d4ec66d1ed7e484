//! Deterministic in-process executor
//!
//! Replays a [`Script`] instead of touching the network. Used by the pool
//! tests and handy for exercising dispatchers without a server.

use super::{
    BodySink, ExecutorFactory, RawResponse, RequestExecutor, RequestSpec, Result, TransferError,
    TransferInfo, render_head,
};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{StatusCode, Version};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// How a scripted transfer plays out
#[derive(Debug, Clone)]
pub struct Script {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub chunks: Vec<Bytes>,
    pub delay: Duration,
    /// Fails before any response arrives
    pub fail_before: Option<TransferError>,
    /// Fails after every chunk has been delivered
    pub fail_after: Option<TransferError>,
}

impl Script {
    pub fn ok<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Bytes>,
    {
        Self {
            status: 200,
            headers: Vec::new(),
            chunks: chunks.into_iter().map(Into::into).collect(),
            delay: Duration::ZERO,
            fail_before: None,
            fail_after: None,
        }
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn fail_before(mut self, error: TransferError) -> Self {
        self.fail_before = Some(error);
        self
    }

    pub fn fail_after(mut self, error: TransferError) -> Self {
        self.fail_after = Some(error);
        self
    }

    fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                map.append(name, value);
            }
        }
        map
    }
}

type Router = Arc<dyn Fn(&RequestSpec) -> Script + Send + Sync>;

/// Creates [`ScriptedExecutor`]s that pick their script from the request
#[derive(Clone)]
pub struct ScriptedFactory {
    router: Router,
    performed: Arc<AtomicUsize>,
}

impl ScriptedFactory {
    pub fn new<F>(router: F) -> Self
    where
        F: Fn(&RequestSpec) -> Script + Send + Sync + 'static,
    {
        Self {
            router: Arc::new(router),
            performed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Every request gets the same script
    pub fn always(script: Script) -> Self {
        Self::new(move |_| script.clone())
    }

    /// Number of transfers started by executors from this factory
    pub fn performed(&self) -> usize {
        self.performed.load(Ordering::SeqCst)
    }
}

impl ExecutorFactory for ScriptedFactory {
    fn create(&self) -> Box<dyn RequestExecutor> {
        Box::new(ScriptedExecutor {
            router: self.router.clone(),
            performed: self.performed.clone(),
            spec: None,
            head: Bytes::new(),
            body: BytesMut::new(),
            info: TransferInfo::default(),
            raw: None,
        })
    }
}

pub struct ScriptedExecutor {
    router: Router,
    performed: Arc<AtomicUsize>,
    spec: Option<RequestSpec>,
    head: Bytes,
    body: BytesMut,
    info: TransferInfo,
    raw: Option<RawResponse>,
}

impl ScriptedExecutor {
    async fn replay(
        &mut self,
        spec: &RequestSpec,
        mut sink: Option<&mut dyn BodySink>,
    ) -> Result<()> {
        let script = (self.router)(spec);

        if !script.delay.is_zero() {
            tokio::time::sleep(script.delay).await;
        }
        if let Some(error) = script.fail_before {
            return Err(error);
        }

        let status = StatusCode::from_u16(script.status)
            .map_err(|e| TransferError::Request(e.to_string()))?;
        let headers = script.header_map();
        self.head = render_head(status, Version::HTTP_11, &headers);
        self.info.status = Some(script.status);
        self.info.effective_url = Some(spec.url.clone());
        self.raw = Some(RawResponse {
            status,
            version: Version::HTTP_11,
            headers,
            remote_addr: None,
        });

        let mut delivering = true;
        for chunk in &script.chunks {
            self.info.bytes_downloaded += chunk.len() as u64;
            match sink.as_mut() {
                Some(sink) if delivering => delivering = sink.on_chunk(chunk) == chunk.len(),
                Some(_) => {}
                None => self.body.extend_from_slice(chunk),
            }
        }

        match script.fail_after {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RequestExecutor for ScriptedExecutor {
    fn configure(&mut self, spec: RequestSpec) -> Result<()> {
        self.spec = Some(spec);
        Ok(())
    }

    async fn perform(&mut self, sink: Option<&mut dyn BodySink>) -> Result<()> {
        let spec = self
            .spec
            .clone()
            .ok_or_else(|| TransferError::Configuration("perform before configure".to_string()))?;
        self.performed.fetch_add(1, Ordering::SeqCst);

        let started = Instant::now();
        let outcome = self.replay(&spec, sink).await;
        self.info.total_time = started.elapsed();

        let secs = self.info.total_time.as_secs_f64();
        if secs > 0.0 {
            self.info.download_speed = self.info.bytes_downloaded as f64 / secs;
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
