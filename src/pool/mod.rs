//! Worker pool
//!
//! Owns a fixed number of workers, the shared idle table and the finalize
//! hook. Every worker pulls from the same dispatcher; finished jobs are handed
//! to the finalize hook from the worker that ran them, so the hook may be
//! called from several tasks at once.
//!
//! ```no_run
//! use fetchpool::dispatch::QueueDispatcher;
//! use fetchpool::job::Job;
//! use fetchpool::pool::{Pool, finalize_channel};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let (on_finalize, mut finished) = finalize_channel();
//! let mut pool = Pool::builder().size(4).on_finalize(on_finalize).build()?;
//!
//! pool.work(QueueDispatcher::from_iter([Job::get("https://example.com")]))?;
//! pool.wait_until_idle().await;
//! pool.close().await?;
//!
//! while let Ok(job) = finished.try_recv() {
//!     println!("{:?}", job.result().map(|r| r.status()));
//! }
//! # Ok(())
//! # }
//! ```

pub mod status;

use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::executor::{ExecutorFactory, HttpConfig, HttpExecutorFactory};
use crate::job::Job;
use crate::observability::Metrics;
use crate::worker::{Worker, WorkerError};
use bon::bon;
use status::IdleTable;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const DEFAULT_IDLE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Receives every finalized job. May run on several workers concurrently.
pub type FinalizeCallback = Arc<dyn Fn(Job) + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("invalid pool configuration: {0}")]
    Configuration(String),

    #[error("pool still has {0} running workers")]
    AlreadyRunning(usize),

    #[error("worker {worker} interrupted while running job {job}")]
    Interrupted { worker: usize, job: Uuid },

    #[error("worker {0} panicked")]
    WorkerPanicked(usize),
}

impl From<WorkerError> for PoolError {
    fn from(e: WorkerError) -> Self {
        match e {
            WorkerError::Interrupted { worker, job } => PoolError::Interrupted { worker, job },
        }
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;

/// A finalize hook that forwards jobs into a channel the caller drains
pub fn finalize_channel() -> (FinalizeCallback, mpsc::UnboundedReceiver<Job>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: FinalizeCallback = Arc::new(move |job| {
        if tx.send(job).is_err() {
            debug!("Finalized job dropped, receiver is gone");
        }
    });
    (callback, rx)
}

/// State every worker of a pool shares
pub struct PoolShared {
    status: IdleTable,
    on_finalize: FinalizeCallback,
    executors: Arc<dyn ExecutorFactory>,
    metrics: Arc<Metrics>,
    idle_poll_interval: Duration,
}

impl PoolShared {
    pub(crate) fn new(
        status: IdleTable,
        on_finalize: FinalizeCallback,
        executors: Arc<dyn ExecutorFactory>,
        metrics: Arc<Metrics>,
        idle_poll_interval: Duration,
    ) -> Self {
        Self {
            status,
            on_finalize,
            executors,
            metrics,
            idle_poll_interval,
        }
    }

    pub fn status(&self) -> &IdleTable {
        &self.status
    }

    pub fn executors(&self) -> &dyn ExecutorFactory {
        self.executors.as_ref()
    }

    pub fn idle_poll_interval(&self) -> Duration {
        self.idle_poll_interval
    }

    pub fn worker_active(&self, worker: usize) {
        debug!(worker, "Worker active");
        self.status.mark_active(worker);
    }

    pub fn worker_idle(&self, worker: usize) {
        debug!(worker, "Worker idle");
        self.status.mark_idle(worker);
    }

    /// Hand a finalized job to the finalize hook. A panicking hook is logged
    /// and does not take the worker down.
    pub fn work_complete(&self, job: Job) {
        if let Some(result) = job.result() {
            self.metrics.record(result);
        }

        let job_id = job.id();
        let on_finalize = &self.on_finalize;
        if panic::catch_unwind(AssertUnwindSafe(|| on_finalize(job))).is_err() {
            error!(%job_id, "Finalize callback panicked");
        }
    }
}

/// Abort handles of the running generation, so an interrupted worker can
/// take the others down with it.
#[derive(Default)]
struct KillSwitch {
    inner: Mutex<KillState>,
}

#[derive(Default)]
struct KillState {
    handles: Vec<(usize, AbortHandle)>,
    tripped_by: Option<usize>,
}

impl KillSwitch {
    fn arm(&self, handles: Vec<(usize, AbortHandle)>) {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.handles = handles;
        if let Some(worker) = state.tripped_by {
            abort_others(&state.handles, worker);
        }
    }

    fn trip(&self, worker: usize) {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        state.tripped_by = Some(worker);
        abort_others(&state.handles, worker);
    }
}

fn abort_others(handles: &[(usize, AbortHandle)], worker: usize) {
    for (id, handle) in handles {
        if *id != worker {
            handle.abort();
        }
    }
}

pub struct Pool {
    size: usize,
    shared: Arc<PoolShared>,
    aborts: Vec<watch::Sender<bool>>,
    handles: Vec<JoinHandle<std::result::Result<(), WorkerError>>>,
}

#[bon]
impl Pool {
    /// Build a pool of `size` workers.
    ///
    /// `on_finalize` is required. Without an `executor` the pool uses the
    /// reqwest transport with default [`HttpConfig`].
    #[builder]
    pub fn new(
        size: usize,
        on_finalize: Option<FinalizeCallback>,
        executor: Option<Arc<dyn ExecutorFactory>>,
        #[builder(default = DEFAULT_IDLE_POLL_INTERVAL)] idle_poll_interval: Duration,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self> {
        let on_finalize = on_finalize
            .ok_or_else(|| PoolError::Configuration("a finalize callback is required".into()))?;

        let executors: Arc<dyn ExecutorFactory> = match executor {
            Some(executor) => executor,
            None => Arc::new(
                HttpExecutorFactory::new(&HttpConfig::default())
                    .map_err(|e| PoolError::Configuration(e.to_string()))?,
            ),
        };

        let shared = PoolShared::new(
            IdleTable::new(),
            on_finalize,
            executors,
            metrics.unwrap_or_default(),
            idle_poll_interval,
        );

        Ok(Self {
            size,
            shared: Arc::new(shared),
            aborts: Vec::new(),
            handles: Vec::new(),
        })
    }
}

impl Pool {
    /// Pool over the reqwest transport, sized and tuned from configuration
    pub fn from_config(config: &Config, on_finalize: FinalizeCallback) -> Result<Self> {
        let executor = HttpExecutorFactory::new(&config.http.to_http_config())
            .map_err(|e| PoolError::Configuration(e.to_string()))?;

        Pool::builder()
            .size(config.pool.size)
            .on_finalize(on_finalize)
            .executor(Arc::new(executor))
            .idle_poll_interval(config.pool.idle_poll_interval())
            .build()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn metrics(&self) -> &Metrics {
        &self.shared.metrics
    }

    /// (Re)create the worker set, all marked idle before any of them runs
    pub(crate) fn init_workers(&mut self, dispatcher: Arc<dyn Dispatcher>) -> Vec<Worker> {
        self.shared.status.reset(self.size);
        self.aborts.clear();

        (0..self.size)
            .map(|id| {
                let (abort_tx, abort_rx) = watch::channel(false);
                self.aborts.push(abort_tx);
                Worker::new(id, self.shared.clone(), dispatcher.clone(), abort_rx)
            })
            .collect()
    }

    /// Start one task per worker, all pulling from `dispatcher`.
    ///
    /// Must be called from within a tokio runtime. Fails while workers of a
    /// previous `work` call are still running.
    pub fn work(&mut self, dispatcher: impl Dispatcher + 'static) -> Result<()> {
        if tokio::runtime::Handle::try_current().is_err() {
            return Err(PoolError::Configuration(
                "work() must be called from within a tokio runtime".into(),
            ));
        }

        let running = self.handles.iter().filter(|h| !h.is_finished()).count();
        if running > 0 {
            return Err(PoolError::AlreadyRunning(running));
        }
        self.handles.clear();

        let workers = self.init_workers(Arc::new(dispatcher));
        let kill_switch = Arc::new(KillSwitch::default());

        self.handles = workers
            .into_iter()
            .map(|worker| {
                let id = worker.id();
                let kill_switch = kill_switch.clone();
                tokio::spawn(async move {
                    let outcome = worker.run().await;
                    if outcome.is_err() {
                        kill_switch.trip(id);
                    }
                    outcome
                })
            })
            .collect();

        kill_switch.arm(
            self.handles
                .iter()
                .enumerate()
                .map(|(id, handle)| (id, handle.abort_handle()))
                .collect(),
        );

        info!(workers = self.size, "Pool started");
        Ok(())
    }

    pub fn worker_active(&self, worker: usize) {
        self.shared.worker_active(worker);
    }

    pub fn worker_idle(&self, worker: usize) {
        self.shared.worker_idle(worker);
    }

    pub fn all_idle(&self) -> bool {
        self.shared.status.all_idle()
    }

    pub fn count_idle(&self) -> usize {
        self.shared.status.count_idle()
    }

    /// Wait until every worker has checked in and found no work.
    ///
    /// Wakes on idle table changes; does not poll.
    pub async fn wait_until_idle(&self) {
        self.shared.status.wait_until_idle().await;
    }

    /// Wait for every worker task to return.
    ///
    /// Killed workers are not an error. An interrupted worker is, and so is a
    /// worker that panicked.
    pub async fn wait_until_closed(&mut self) -> Result<()> {
        let mut outcome = Ok(());

        for (worker, handle) in self.handles.drain(..).enumerate() {
            let failure = match handle.await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(PoolError::from(e)),
                Err(e) if e.is_cancelled() => {
                    debug!(worker, "Worker was killed");
                    None
                }
                Err(_) => {
                    error!(worker, "Worker panicked");
                    Some(PoolError::WorkerPanicked(worker))
                }
            };

            // Interrupts win over panics
            if let Some(failure) = failure {
                let replace = match &outcome {
                    Ok(()) => true,
                    Err(PoolError::Interrupted { .. }) => false,
                    Err(_) => matches!(failure, PoolError::Interrupted { .. }),
                };
                if replace {
                    outcome = Err(failure);
                }
            }
        }

        if outcome.is_ok() {
            info!("Pool closed");
        }
        outcome
    }

    /// Abort every worker task right away.
    ///
    /// Jobs in flight are dropped without being finalized.
    pub fn kill_workers(&self) {
        warn!(workers = self.handles.len(), "Killing workers");
        for handle in &self.handles {
            handle.abort();
        }
        self.shared.status.mark_all_idle();
    }

    /// Ask every worker to stop at its next checkpoint
    pub fn close_non_blocking(&self) {
        debug!("Requesting worker shutdown");
        for abort in &self.aborts {
            abort.send_replace(true);
        }
    }

    /// Graceful close: jobs in flight still finish and are finalized
    pub async fn close(&mut self) -> Result<()> {
        self.close_non_blocking();
        self.wait_until_closed().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Script, ScriptedFactory};

    fn scripted_pool(size: usize) -> Pool {
        Pool::builder()
            .size(size)
            .on_finalize(Arc::new(|_job: Job| {}))
            .executor(Arc::new(ScriptedFactory::always(Script::ok(["x"]))))
            .build()
            .unwrap()
    }

    #[test]
    fn test_finalize_callback_is_required() {
        let result = Pool::builder()
            .size(2)
            .executor(Arc::new(ScriptedFactory::always(Script::ok(["x"]))))
            .build();
        assert!(matches!(result, Err(PoolError::Configuration(_))));
    }

    #[test]
    fn test_all_idle_right_after_init() {
        let mut pool = scripted_pool(3);
        let workers = pool.init_workers(Arc::new(|| None::<Job>));

        assert_eq!(workers.len(), 3);
        assert_eq!(
            workers.iter().map(Worker::id).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(pool.all_idle());
        assert_eq!(pool.count_idle(), 3);
    }

    #[test]
    fn test_work_outside_runtime_is_rejected() {
        let mut pool = scripted_pool(1);
        let err = pool.work(|| None::<Job>).unwrap_err();
        assert!(matches!(err, PoolError::Configuration(_)));
    }

    #[test]
    fn test_worker_error_maps_to_interrupt() {
        let job = Uuid::now_v7();
        let err = PoolError::from(WorkerError::Interrupted { worker: 2, job });
        assert_eq!(err, PoolError::Interrupted { worker: 2, job });
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let shared = PoolShared::new(
            IdleTable::new(),
            Arc::new(|_job: Job| panic!("callback bug")),
            Arc::new(ScriptedFactory::always(Script::ok(["x"]))),
            Arc::new(Metrics::new()),
            DEFAULT_IDLE_POLL_INTERVAL,
        );
        shared.work_complete(Job::get("scripted://x"));
    }

    #[tokio::test]
    async fn test_restart_while_running_is_rejected() {
        let mut pool = scripted_pool(2);
        pool.work(|| None::<Job>).unwrap();
        assert_eq!(pool.work(|| None::<Job>), Err(PoolError::AlreadyRunning(2)));

        pool.close().await.unwrap();
        pool.work(|| None::<Job>).unwrap();
        pool.close().await.unwrap();
    }
}
