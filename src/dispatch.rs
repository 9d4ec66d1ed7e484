//! Dispatchers: where workers pull their jobs from
//!
//! Every worker of a pool calls the same dispatcher, concurrently, whenever
//! it is ready for more work. A dispatcher must answer right away: either a
//! job or "nothing right now". It must not wait for work to show up.

use crate::job::Job;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

pub type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Pull source of jobs shared by all workers of a pool
pub trait Dispatcher: Send + Sync {
    /// Next job, `Ok(None)` when there is no work right now.
    ///
    /// Errors are logged by the worker and treated like "no work".
    fn dispatch(&self) -> Result<Option<Job>, AnyError>;
}

impl<F> Dispatcher for F
where
    F: Fn() -> Option<Job> + Send + Sync,
{
    fn dispatch(&self) -> Result<Option<Job>, AnyError> {
        Ok(self())
    }
}

/// FIFO dispatcher.
///
/// To keep refilling it while a pool runs, share it through an `Arc` and
/// hand the pool a closure: `move || queue.dispatch().ok().flatten()`.
#[derive(Debug, Default)]
pub struct QueueDispatcher {
    queue: Mutex<VecDeque<Job>>,
}

impl QueueDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, job: Job) {
        self.lock().push_back(job);
    }

    pub fn extend(&self, jobs: impl IntoIterator<Item = Job>) {
        self.lock().extend(jobs);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<Job>> {
        // Jobs are plain data; a panic elsewhere cannot leave the queue half-updated.
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FromIterator<Job> for QueueDispatcher {
    fn from_iter<I: IntoIterator<Item = Job>>(iter: I) -> Self {
        Self {
            queue: Mutex::new(iter.into_iter().collect()),
        }
    }
}

impl Dispatcher for QueueDispatcher {
    fn dispatch(&self) -> Result<Option<Job>, AnyError> {
        Ok(self.lock().pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_queue_is_fifo() {
        let queue: QueueDispatcher = ["a", "b"].into_iter().map(Job::get).collect();
        queue.push(Job::get("c"));
        assert_eq!(queue.len(), 3);

        let labels: Vec<String> = std::iter::from_fn(|| queue.dispatch().unwrap())
            .map(|job| job.label().unwrap().to_string())
            .collect();
        assert_eq!(labels, ["a", "b", "c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_closure_dispatcher() {
        let remaining = AtomicUsize::new(2);
        let dispatcher = move || {
            remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .ok()
                .map(|_| Job::get("http://example.com"))
        };

        assert!(dispatcher.dispatch().unwrap().is_some());
        assert!(dispatcher.dispatch().unwrap().is_some());
        assert!(dispatcher.dispatch().unwrap().is_none());
    }

    #[test]
    fn test_concurrent_pulls_hand_out_each_job_once() {
        let queue: Arc<QueueDispatcher> =
            Arc::new((0..200).map(|i| Job::get(format!("job-{i}"))).collect());

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                std::thread::spawn(move || {
                    let mut ids = Vec::new();
                    while let Some(job) = queue.dispatch().unwrap() {
                        ids.push(job.id());
                    }
                    ids
                })
            })
            .collect();

        let mut ids: Vec<_> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 200);
    }
}
