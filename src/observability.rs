//! Pool counters

use crate::job::JobResult;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters updated by workers as jobs finish
#[derive(Debug, Default)]
pub struct Metrics {
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_truncated: AtomicU64,
    bytes_downloaded: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, result: &JobResult) {
        if result.is_success() {
            self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        }
        if result.truncated() {
            self.jobs_truncated.fetch_add(1, Ordering::Relaxed);
        }
        self.bytes_downloaded
            .fetch_add(result.properties.bytes_downloaded, Ordering::Relaxed);

        tracing::trace!(
            success = result.is_success(),
            bytes = result.properties.bytes_downloaded,
            "Metrics recorded"
        );
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_truncated: self.jobs_truncated.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub jobs_truncated: u64,
    pub bytes_downloaded: u64,
}

impl MetricsSnapshot {
    pub fn jobs_finished(&self) -> u64 {
        self.jobs_completed + self.jobs_failed
    }
}
