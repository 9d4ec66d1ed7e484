//! Job runner - executes one job against one executor and finalizes it

use super::capture::BodyCapture;
use crate::executor::{BodySink, RequestExecutor, TransferError};
use crate::job::{Job, JobError, JobResult, ResponseProperties};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RunError {
    /// The transfer was interrupted; the job was left unfinalized
    #[error("job {0} interrupted")]
    Interrupted(Uuid),

    #[error(transparent)]
    Finalize(#[from] JobError),
}

pub type Result<T> = std::result::Result<T, RunError>;

/// Execute `job` on `executor` and record the outcome on the job.
///
/// Transfer failures end up in the job's result. Only an interrupt comes back
/// as an error, and then the job is not finalized.
pub async fn complete_request(
    mut job: Job,
    mut executor: Box<dyn RequestExecutor>,
) -> Result<Job> {
    let job_id = job.id();
    let mut capture = job
        .config()
        .max_body_size
        .map(|limit| BodyCapture::new(limit.as_usize()));

    debug!(%job_id, label = job.label(), limit = ?job.config().max_body_size, "Running job");

    let outcome = match job.configure(executor.as_mut()) {
        Ok(()) => {
            let sink = capture.as_mut().map(|c| c as &mut dyn BodySink);
            executor.perform(sink).await
        }
        Err(JobError::Transfer(e)) => Err(e),
        Err(e) => Err(TransferError::Configuration(e.to_string())),
    };

    if let Err(e) = &outcome {
        if e.is_interrupt() {
            warn!(%job_id, "Job interrupted, leaving it unfinalized");
            return Err(RunError::Interrupted(job_id));
        }
    }

    let truncated = capture.as_ref().is_some_and(BodyCapture::truncated);
    let body = match capture {
        Some(capture) => capture.into_body(),
        None => executor.body(),
    };
    let properties = ResponseProperties::from_transfer(executor.info(), truncated);

    match &outcome {
        Ok(()) => info!(
            %job_id,
            status = properties.status,
            bytes = properties.bytes_downloaded,
            truncated,
            "Job completed"
        ),
        Err(e) => warn!(
            %job_id,
            status = properties.status,
            bytes = properties.bytes_downloaded,
            error = %e,
            "Job failed"
        ),
    }

    job.finalize(JobResult {
        head: executor.head(),
        body,
        properties,
        raw_response: executor.raw_response(),
        error: outcome.err(),
        finished_at: OffsetDateTime::now_utc(),
    })?;

    Ok(job)
}
