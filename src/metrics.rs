//! Pipeline counters.
//!
//! The only shared mutable state outside the backends: a block of
//! atomics bumped by the ingress path and the workers, snapshotted for
//! `GET /metrics`.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Default)]
pub struct PipelineMetrics {
    pub documents_accepted: AtomicU64,
    pub documents_completed: AtomicU64,
    pub documents_failed: AtomicU64,
    pub documents_cancelled: AtomicU64,
    pub steps_executed: AtomicU64,
    pub steps_retried: AtomicU64,
    pub dead_letters: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub documents_accepted: u64,
    pub documents_completed: u64,
    pub documents_failed: u64,
    pub documents_cancelled: u64,
    pub steps_executed: u64,
    pub steps_retried: u64,
    pub dead_letters: u64,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            documents_accepted: self.documents_accepted.load(Ordering::Relaxed),
            documents_completed: self.documents_completed.load(Ordering::Relaxed),
            documents_failed: self.documents_failed.load(Ordering::Relaxed),
            documents_cancelled: self.documents_cancelled.load(Ordering::Relaxed),
            steps_executed: self.steps_executed.load(Ordering::Relaxed),
            steps_retried: self.steps_retried.load(Ordering::Relaxed),
            dead_letters: self.dead_letters.load(Ordering::Relaxed),
        }
    }
}
