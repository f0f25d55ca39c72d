//! In-memory [`JobQueue`] for tests and single-process deployments.
//!
//! A `VecDeque` of visible messages plus a map of in-flight leases
//! behind one `std::sync::Mutex`. Expired leases are reclaimed lazily on
//! the next `dequeue`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::error::MemoryError;

use super::{DeadLetter, JobMessage, JobQueue, LeaseToken, LeasedJob, NackOutcome};

struct Pending {
    message: JobMessage,
    not_before: Instant,
}

struct InFlight {
    message: JobMessage,
    deadline: Instant,
}

#[derive(Default)]
struct Inner {
    pending: VecDeque<Pending>,
    in_flight: HashMap<String, InFlight>,
    dead: Vec<DeadLetter>,
}

pub struct MemoryQueue {
    inner: Mutex<Inner>,
    visibility: Duration,
    max_attempts: u32,
}

impl MemoryQueue {
    pub fn new(visibility: Duration, max_attempts: u32) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            visibility,
            max_attempts,
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, MemoryError> {
        self.inner
            .lock()
            .map_err(|_| MemoryError::transient("queue lock poisoned"))
    }

    /// Return expired leases to the front of the visible queue. The
    /// attempt counter is untouched: expiry is not an attempt.
    fn reclaim_expired(inner: &mut Inner, now: Instant) {
        let expired: Vec<String> = inner
            .in_flight
            .iter()
            .filter(|(_, f)| f.deadline <= now)
            .map(|(lease, _)| lease.clone())
            .collect();
        for lease in expired {
            if let Some(flight) = inner.in_flight.remove(&lease) {
                inner.pending.push_front(Pending {
                    message: flight.message,
                    not_before: now,
                });
            }
        }
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, message: JobMessage) -> Result<(), MemoryError> {
        let mut inner = self.lock()?;
        inner.pending.push_back(Pending {
            message,
            not_before: Instant::now(),
        });
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<LeasedJob>, MemoryError> {
        let now = Instant::now();
        let mut inner = self.lock()?;
        Self::reclaim_expired(&mut inner, now);

        let leased_docs: HashSet<String> = inner
            .in_flight
            .values()
            .map(|f| f.message.document_key())
            .collect();

        let position = inner.pending.iter().position(|p| {
            p.not_before <= now && !leased_docs.contains(&p.message.document_key())
        });
        let Some(position) = position else {
            return Ok(None);
        };

        let pending = inner
            .pending
            .remove(position)
            .ok_or_else(|| MemoryError::transient("queue entry vanished"))?;
        let lease = LeaseToken(Uuid::new_v4().to_string());
        inner.in_flight.insert(
            lease.0.clone(),
            InFlight {
                message: pending.message.clone(),
                deadline: now + self.visibility,
            },
        );
        Ok(Some(LeasedJob {
            message: pending.message,
            lease,
        }))
    }

    async fn ack(&self, lease: &LeaseToken) -> Result<(), MemoryError> {
        let mut inner = self.lock()?;
        inner.in_flight.remove(&lease.0);
        Ok(())
    }

    async fn nack(
        &self,
        lease: &LeaseToken,
        delay: Duration,
        error: &str,
    ) -> Result<NackOutcome, MemoryError> {
        let mut inner = self.lock()?;
        let Some(flight) = inner.in_flight.remove(&lease.0) else {
            // Lease already expired; the message is visible again.
            return Ok(NackOutcome::Requeued);
        };

        let mut message = flight.message;
        message.attempt += 1;
        if message.attempt > self.max_attempts {
            inner.dead.push(DeadLetter {
                message,
                last_error: error.to_string(),
                failed_at: Utc::now(),
            });
            return Ok(NackOutcome::DeadLettered);
        }

        inner.pending.push_back(Pending {
            message,
            not_before: Instant::now() + delay,
        });
        Ok(NackOutcome::Requeued)
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, MemoryError> {
        Ok(self.lock()?.dead.clone())
    }
}
