//! Download workers
//!
//! A worker is one task that keeps pulling jobs from the pool's dispatcher,
//! runs each one through a fresh executor and hands the finalized job back
//! to the pool. It stops only when the pool asks it to, at one of two
//! checkpoints: right after a job, or right after an idle backoff.

pub mod capture;
pub mod runner;

pub use capture::BodyCapture;
pub use runner::{RunError, complete_request};

use crate::dispatch::Dispatcher;
use crate::job::Job;
use crate::pool::PoolShared;
use futures::FutureExt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, warn};
use uuid::Uuid;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkerError {
    #[error("worker {worker} interrupted while running job {job}")]
    Interrupted { worker: usize, job: Uuid },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Last dispatch came back empty (or nothing was dispatched yet)
    Idle,
    Active,
    Terminated,
}

pub struct Worker {
    id: usize,
    pool: Arc<PoolShared>,
    dispatcher: Arc<dyn Dispatcher>,
    abort: watch::Receiver<bool>,
    state: WorkerState,
}

impl Worker {
    pub(crate) fn new(
        id: usize,
        pool: Arc<PoolShared>,
        dispatcher: Arc<dyn Dispatcher>,
        abort: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id,
            pool,
            dispatcher,
            abort,
            state: WorkerState::Idle,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Run until the pool requests an abort.
    ///
    /// Returns an error only when a transfer was interrupted.
    pub async fn run(mut self) -> Result<(), WorkerError> {
        debug!(worker = self.id, "Worker started");
        // Also fires when the task is aborted mid-job
        let _idle_on_exit = IdleOnExit {
            pool: self.pool.clone(),
            worker: self.id,
        };

        loop {
            match self.next_job() {
                Some(job) => {
                    if self.state == WorkerState::Idle {
                        self.pool.worker_active(self.id);
                    }
                    self.state = WorkerState::Active;

                    self.execute(job).await?;

                    if self.abort_requested() {
                        break;
                    }
                }
                None => {
                    self.pool.worker_idle(self.id);
                    self.state = WorkerState::Idle;

                    self.idle_backoff().await;

                    if self.abort_requested() {
                        break;
                    }
                }
            }
        }

        self.state = WorkerState::Terminated;
        debug!(worker = self.id, "Worker stopped");
        Ok(())
    }

    /// Ask the dispatcher for work. Failures and panics count as "no work".
    fn next_job(&self) -> Option<Job> {
        match panic::catch_unwind(AssertUnwindSafe(|| self.dispatcher.dispatch())) {
            Ok(Ok(job)) => job,
            Ok(Err(e)) => {
                warn!(worker = self.id, error = %e, "Dispatcher failed");
                None
            }
            Err(_) => {
                error!(worker = self.id, "Dispatcher panicked");
                None
            }
        }
    }

    /// Run one job. A panicking executor costs that job only.
    async fn execute(&self, job: Job) -> Result<(), WorkerError> {
        let job_id = job.id();
        let run = async {
            let executor = self.pool.executors().create();
            complete_request(job, executor).await
        };

        let outcome = match AssertUnwindSafe(run).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(worker = self.id, %job_id, "Executor panicked, job dropped");
                return Ok(());
            }
        };

        match outcome {
            Ok(job) => {
                self.pool.work_complete(job);
                Ok(())
            }
            Err(RunError::Interrupted(job)) => {
                error!(worker = self.id, %job, "Transfer interrupted, stopping worker");
                Err(WorkerError::Interrupted {
                    worker: self.id,
                    job,
                })
            }
            Err(RunError::Finalize(e)) => {
                error!(worker = self.id, %job_id, error = %e, "Could not finalize job");
                Ok(())
            }
        }
    }

    /// Sleep one poll interval, waking early if an abort comes in
    async fn idle_backoff(&mut self) {
        if self.abort_requested() {
            return;
        }

        let interval = self.pool.idle_poll_interval();
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = self.abort.changed() => {}
        }
    }

    /// A dropped pool counts as an abort request.
    fn abort_requested(&self) -> bool {
        *self.abort.borrow() || self.abort.has_changed().is_err()
    }
}

struct IdleOnExit {
    pool: Arc<PoolShared>,
    worker: usize,
}

impl Drop for IdleOnExit {
    fn drop(&mut self) {
        self.pool.worker_idle(self.worker);
    }
}
