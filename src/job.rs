//! Jobs: one request description plus a write-once result

use crate::executor::{RawResponse, RequestExecutor, RequestSpec, TransferError, TransferInfo};
use crate::humanize::ByteSize;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JobError {
    #[error("job {0} has no request configuration")]
    Configuration(Uuid),

    #[error("job {0} is already finalized")]
    AlreadyFinalized(Uuid),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

pub type Result<T> = std::result::Result<T, JobError>;

/// Sets up the request for a job. Called once per execution, on the worker.
pub type Configurator = Arc<dyn Fn(&mut RequestSpec) + Send + Sync>;

/// Worker-level options carried by a job
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct JobConfig {
    /// Cap on captured body bytes. `None` captures the whole body.
    #[serde(default)]
    pub max_body_size: Option<ByteSize>,
}

/// Response facts recorded on a finished job
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResponseProperties {
    pub round_trip_time: Duration,
    pub redirect_time: Option<Duration>,
    pub dns_lookup_time: Option<Duration>,
    pub effective_uri: Option<String>,
    pub status: Option<u16>,
    pub download_speed: f64,
    pub bytes_downloaded: u64,
    pub truncated: bool,
}

impl ResponseProperties {
    pub fn from_transfer(info: TransferInfo, truncated: bool) -> Self {
        Self {
            round_trip_time: info.total_time,
            redirect_time: info.redirect_time,
            dns_lookup_time: info.dns_lookup_time,
            effective_uri: info.effective_url,
            status: info.status,
            download_speed: info.download_speed,
            bytes_downloaded: info.bytes_downloaded,
            truncated,
        }
    }
}

/// Outcome of one execution.
///
/// A failed transfer still carries whatever head and body arrived first.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub head: Bytes,
    pub body: Bytes,
    pub properties: ResponseProperties,
    pub raw_response: Option<RawResponse>,
    pub error: Option<TransferError>,
    pub finished_at: OffsetDateTime,
}

impl JobResult {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn status(&self) -> Option<u16> {
        self.properties.status
    }

    pub fn truncated(&self) -> bool {
        self.properties.truncated
    }
}

#[derive(Debug, Clone)]
pub enum JobState {
    Pending,
    Finalized(Box<JobResult>),
}

/// A unit of work handed out by a dispatcher.
///
/// Ownership moves from the dispatcher to a worker, and from the worker to
/// the pool's finalize hook once the result is in.
pub struct Job {
    id: Uuid,
    label: Option<String>,
    config: JobConfig,
    configurator: Option<Configurator>,
    state: JobState,
}

impl Job {
    /// A job without request configuration; `configure` will fail until
    /// one is attached with [`Job::with_request`].
    pub fn new(config: JobConfig) -> Self {
        Self {
            id: Uuid::now_v7(),
            label: None,
            config,
            configurator: None,
            state: JobState::Pending,
        }
    }

    /// Plain GET of `url`
    pub fn get(url: impl Into<String>) -> Self {
        let url = url.into();
        let target = url.clone();
        Self::new(JobConfig::default())
            .with_label(url)
            .with_request(move |spec| spec.url = target.clone())
    }

    pub fn with_request<F>(mut self, configure: F) -> Self
    where
        F: Fn(&mut RequestSpec) + Send + Sync + 'static,
    {
        self.configurator = Some(Arc::new(configure));
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_max_body_size(mut self, limit: ByteSize) -> Self {
        self.config.max_body_size = Some(limit);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn state(&self) -> &JobState {
        &self.state
    }

    /// Run the configurator and hand the resulting request to `executor`
    pub fn configure(&self, executor: &mut dyn RequestExecutor) -> Result<()> {
        let configurator = self
            .configurator
            .as_ref()
            .ok_or(JobError::Configuration(self.id))?;

        let mut spec = RequestSpec::default();
        configurator(&mut spec);
        executor.configure(spec)?;
        Ok(())
    }

    /// Record the result. A second call fails and leaves the first result intact.
    pub fn finalize(&mut self, result: JobResult) -> Result<()> {
        match self.state {
            JobState::Finalized(_) => Err(JobError::AlreadyFinalized(self.id)),
            JobState::Pending => {
                self.state = JobState::Finalized(Box::new(result));
                Ok(())
            }
        }
    }

    pub fn is_finalized(&self) -> bool {
        matches!(self.state, JobState::Finalized(_))
    }

    pub fn result(&self) -> Option<&JobResult> {
        match &self.state {
            JobState::Finalized(result) => Some(result),
            JobState::Pending => None,
        }
    }

    pub fn into_result(self) -> Option<JobResult> {
        match self.state {
            JobState::Finalized(result) => Some(*result),
            JobState::Pending => None,
        }
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("config", &self.config)
            .field("configured", &self.configurator.is_some())
            .field("state", &self.state)
            .finish()
    }
}
