//! Durable work queue with per-document ordering and poison handling.
//!
//! The pipeline is driven by [`JobQueue`]: the orchestrator enqueues one
//! message per pending step and workers compete to dequeue them. The
//! contract every backend honours:
//!
//! - **Delivery**: at-least-once. Handlers are idempotent, so a message
//!   redelivered after a crash or lease expiry re-runs safely.
//! - **Visibility**: a dequeued message is invisible to other consumers
//!   until its lease expires or it is acked/nacked. Lease expiry returns
//!   the message unchanged — it is not an attempt.
//! - **Ordering**: FIFO per (index, document id), with at most one
//!   outstanding lease per document. No ordering across documents.
//! - **Poison**: `nack` increments the attempt counter; past
//!   `max_attempts` the message moves to the dead-letter area and the
//!   caller is told via [`NackOutcome::DeadLettered`].
//!
//! # Backends
//!
//! | Backend | Module | Use |
//! |---------|--------|-----|
//! | In-memory | [`memory`] | tests, single-process |
//! | Filesystem | [`disk`] | durable single-node; claim-by-rename locks |

pub mod disk;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MemoryError;

/// Work item: "run the next pending step of this document".
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobMessage {
    pub index: String,
    pub document_id: String,
    /// Number of times this message has been nacked. Lease expiry does
    /// not increment it.
    #[serde(default)]
    pub attempt: u32,
}

impl JobMessage {
    pub fn new(index: impl Into<String>, document_id: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            document_id: document_id.into(),
            attempt: 0,
        }
    }

    /// Identity used for per-document ordering and lease exclusion.
    pub fn document_key(&self) -> String {
        format!("{}/{}", self.index, self.document_id)
    }
}

/// Opaque time-bounded claim on a dequeued message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaseToken(pub(crate) String);

impl LeaseToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A dequeued message plus the lease that must be settled.
#[derive(Debug, Clone)]
pub struct LeasedJob {
    pub message: JobMessage,
    pub lease: LeaseToken,
}

/// What `nack` did with the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// Returned to the queue with an incremented attempt counter.
    Requeued,
    /// Attempt counter exceeded `max_attempts`; moved to dead letters.
    DeadLettered,
}

/// A message that exhausted its retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message: JobMessage,
    pub last_error: String,
    pub failed_at: DateTime<Utc>,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Append a message behind any earlier messages of the same document.
    async fn enqueue(&self, message: JobMessage) -> Result<(), MemoryError>;

    /// Claim the oldest visible message whose document has no active
    /// lease. `None` when nothing is eligible.
    async fn dequeue(&self) -> Result<Option<LeasedJob>, MemoryError>;

    /// Settle a lease: the message is done and removed. Acking an
    /// expired or unknown lease is a no-op.
    async fn ack(&self, lease: &LeaseToken) -> Result<(), MemoryError>;

    /// Return the message to the queue after `delay`, incrementing its
    /// attempt counter, or move it to the dead-letter area once the
    /// counter exceeds `max_attempts`.
    async fn nack(
        &self,
        lease: &LeaseToken,
        delay: Duration,
        error: &str,
    ) -> Result<NackOutcome, MemoryError>;

    /// Messages that exhausted their retry budget, oldest first.
    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, MemoryError>;
}
