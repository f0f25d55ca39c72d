//! Filesystem [`JobQueue`] for durable single-node deployments.
//!
//! Layout under the queue root:
//!
//! ```text
//! ready/    one JSON file per visible message, name = enqueue sequence
//! claimed/  one JSON file per leased message, name = lease token
//! dead/     one JSON file per poisoned message
//! ```
//!
//! The advisory lock is the claim rename: moving `ready/<seq>.json` to
//! `claimed/<lease>.json` succeeds for exactly one consumer, so two
//! processes sharing the directory never double-claim. A message keeps
//! its original sequence name through nacks and lease expiry, which
//! preserves its FIFO position within the document.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MemoryError;

use super::{DeadLetter, JobMessage, JobQueue, LeaseToken, LeasedJob, NackOutcome};

#[derive(Serialize, Deserialize)]
struct ReadyEnvelope {
    message: JobMessage,
    not_before: DateTime<Utc>,
    /// Sequence file name, kept so nack and expiry can restore position.
    file_name: String,
}

#[derive(Serialize, Deserialize)]
struct ClaimedEnvelope {
    message: JobMessage,
    lease_deadline: DateTime<Utc>,
    file_name: String,
}

pub struct FsQueue {
    ready: PathBuf,
    claimed: PathBuf,
    dead: PathBuf,
    visibility: Duration,
    max_attempts: u32,
    seq: AtomicU64,
}

impl FsQueue {
    pub fn new(
        root: impl Into<PathBuf>,
        visibility: Duration,
        max_attempts: u32,
    ) -> Result<Self, MemoryError> {
        let root = root.into();
        let ready = root.join("ready");
        let claimed = root.join("claimed");
        let dead = root.join("dead");
        for dir in [&ready, &claimed, &dead] {
            fs::create_dir_all(dir)
                .map_err(|e| MemoryError::transient(format!("create queue dir: {e}")))?;
        }
        Ok(Self {
            ready,
            claimed,
            dead,
            visibility,
            max_attempts,
            seq: AtomicU64::new(0),
        })
    }

    fn next_file_name(&self) -> String {
        let nanos = Utc::now().timestamp_nanos_opt().unwrap_or(0).max(0);
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("{nanos:020}-{seq:06}.json")
    }

    fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), MemoryError> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| MemoryError::transient(format!("encode queue message: {e}")))?;
        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
        fs::write(&tmp, bytes)
            .map_err(|e| MemoryError::transient(format!("write queue message: {e}")))?;
        fs::rename(&tmp, path)
            .map_err(|e| MemoryError::transient(format!("commit queue message: {e}")))?;
        Ok(())
    }

    fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, MemoryError> {
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map(Some).map_err(|e| {
                MemoryError::DataIntegrity(format!("corrupt queue message {path:?}: {e}"))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(MemoryError::transient(format!(
                "read queue message {path:?}: {e}"
            ))),
        }
    }

    fn list_dir(dir: &Path) -> Result<Vec<PathBuf>, MemoryError> {
        let mut paths = Vec::new();
        let entries = fs::read_dir(dir)
            .map_err(|e| MemoryError::transient(format!("list queue dir {dir:?}: {e}")))?;
        for entry in entries {
            let entry =
                entry.map_err(|e| MemoryError::transient(format!("list queue dir: {e}")))?;
            let path = entry.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Move expired claims back into `ready/` under their original
    /// sequence names; attempt counters are untouched.
    fn reclaim_expired(&self, now: DateTime<Utc>) -> Result<(), MemoryError> {
        for path in Self::list_dir(&self.claimed)? {
            let Some(envelope) = Self::read_json::<ClaimedEnvelope>(&path)? else {
                continue;
            };
            if envelope.lease_deadline > now {
                continue;
            }
            let restored = ReadyEnvelope {
                message: envelope.message,
                not_before: now,
                file_name: envelope.file_name.clone(),
            };
            Self::write_json(&self.ready.join(&envelope.file_name), &restored)?;
            let _ = fs::remove_file(&path);
        }
        Ok(())
    }

    fn claimed_document_keys(&self) -> Result<Vec<String>, MemoryError> {
        let mut keys = Vec::new();
        for path in Self::list_dir(&self.claimed)? {
            if let Some(envelope) = Self::read_json::<ClaimedEnvelope>(&path)? {
                keys.push(envelope.message.document_key());
            }
        }
        Ok(keys)
    }
}

#[async_trait]
impl JobQueue for FsQueue {
    async fn enqueue(&self, message: JobMessage) -> Result<(), MemoryError> {
        let file_name = self.next_file_name();
        let envelope = ReadyEnvelope {
            message,
            not_before: Utc::now(),
            file_name: file_name.clone(),
        };
        Self::write_json(&self.ready.join(&file_name), &envelope)
    }

    async fn dequeue(&self) -> Result<Option<LeasedJob>, MemoryError> {
        let now = Utc::now();
        self.reclaim_expired(now)?;
        let leased_docs = self.claimed_document_keys()?;

        for path in Self::list_dir(&self.ready)? {
            let Some(envelope) = Self::read_json::<ReadyEnvelope>(&path)? else {
                continue;
            };
            if envelope.not_before > now {
                continue;
            }
            if leased_docs.contains(&envelope.message.document_key()) {
                continue;
            }

            // The rename is the claim: only one consumer wins it.
            let lease = LeaseToken(Uuid::new_v4().to_string());
            let claimed_path = self.claimed.join(format!("{}.json", lease.0));
            if fs::rename(&path, &claimed_path).is_err() {
                continue;
            }

            let visibility = chrono::Duration::from_std(self.visibility)
                .unwrap_or_else(|_| chrono::Duration::seconds(120));
            let claimed = ClaimedEnvelope {
                message: envelope.message.clone(),
                lease_deadline: now + visibility,
                file_name: envelope.file_name,
            };
            Self::write_json(&claimed_path, &claimed)?;
            return Ok(Some(LeasedJob {
                message: envelope.message,
                lease,
            }));
        }
        Ok(None)
    }

    async fn ack(&self, lease: &LeaseToken) -> Result<(), MemoryError> {
        let path = self.claimed.join(format!("{}.json", lease.0));
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MemoryError::transient(format!("ack lease: {e}"))),
        }
    }

    async fn nack(
        &self,
        lease: &LeaseToken,
        delay: Duration,
        error: &str,
    ) -> Result<NackOutcome, MemoryError> {
        let path = self.claimed.join(format!("{}.json", lease.0));
        let Some(envelope) = Self::read_json::<ClaimedEnvelope>(&path)? else {
            return Ok(NackOutcome::Requeued);
        };

        let mut message = envelope.message;
        message.attempt += 1;

        if message.attempt > self.max_attempts {
            let letter = DeadLetter {
                message,
                last_error: error.to_string(),
                failed_at: Utc::now(),
            };
            Self::write_json(&self.dead.join(&envelope.file_name), &letter)?;
            let _ = fs::remove_file(&path);
            return Ok(NackOutcome::DeadLettered);
        }

        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        let restored = ReadyEnvelope {
            message,
            not_before: Utc::now() + delay,
            file_name: envelope.file_name.clone(),
        };
        Self::write_json(&self.ready.join(&envelope.file_name), &restored)?;
        let _ = fs::remove_file(&path);
        Ok(NackOutcome::Requeued)
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, MemoryError> {
        let mut letters = Vec::new();
        for path in Self::list_dir(&self.dead)? {
            if let Some(letter) = Self::read_json::<DeadLetter>(&path)? {
                letters.push(letter);
            }
        }
        Ok(letters)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn queue(tmp: &TempDir, visibility: Duration, max_attempts: u32) -> FsQueue {
        FsQueue::new(tmp.path().join("queue"), visibility, max_attempts).unwrap()
    }

    #[tokio::test]
    async fn fifo_across_enqueues() {
        let tmp = TempDir::new().unwrap();
        let q = queue(&tmp, Duration::from_secs(60), 3);
        q.enqueue(JobMessage::new("idx", "a")).await.unwrap();
        q.enqueue(JobMessage::new("idx", "b")).await.unwrap();

        assert_eq!(q.dequeue().await.unwrap().unwrap().message.document_id, "a");
        assert_eq!(q.dequeue().await.unwrap().unwrap().message.document_id, "b");
        assert!(q.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn one_lease_per_document_across_restarts() {
        let tmp = TempDir::new().unwrap();
        let q = queue(&tmp, Duration::from_secs(60), 3);
        q.enqueue(JobMessage::new("idx", "a")).await.unwrap();
        q.enqueue(JobMessage::new("idx", "a")).await.unwrap();

        let first = q.dequeue().await.unwrap().unwrap();

        // A second consumer over the same directory sees the claim.
        let q2 = queue(&tmp, Duration::from_secs(60), 3);
        assert!(q2.dequeue().await.unwrap().is_none());

        q.ack(&first.lease).await.unwrap();
        assert!(q2.dequeue().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn survives_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let q = queue(&tmp, Duration::from_secs(60), 3);
            q.enqueue(JobMessage::new("idx", "a")).await.unwrap();
        }
        let q = queue(&tmp, Duration::from_secs(60), 3);
        let job = q.dequeue().await.unwrap().unwrap();
        assert_eq!(job.message.document_id, "a");
    }

    #[tokio::test]
    async fn lease_expiry_restores_message_unchanged() {
        let tmp = TempDir::new().unwrap();
        let q = queue(&tmp, Duration::from_millis(20), 3);
        q.enqueue(JobMessage::new("idx", "a")).await.unwrap();

        let _job = q.dequeue().await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let redelivered = q.dequeue().await.unwrap().unwrap();
        assert_eq!(redelivered.message.attempt, 0);
    }

    #[tokio::test]
    async fn nack_then_poison() {
        let tmp = TempDir::new().unwrap();
        let q = queue(&tmp, Duration::from_secs(60), 1);
        q.enqueue(JobMessage::new("idx", "a")).await.unwrap();

        let job = q.dequeue().await.unwrap().unwrap();
        assert_eq!(
            q.nack(&job.lease, Duration::ZERO, "e1").await.unwrap(),
            NackOutcome::Requeued
        );

        let job = q.dequeue().await.unwrap().unwrap();
        assert_eq!(job.message.attempt, 1);
        assert_eq!(
            q.nack(&job.lease, Duration::ZERO, "e2").await.unwrap(),
            NackOutcome::DeadLettered
        );

        assert!(q.dequeue().await.unwrap().is_none());
        let dead = q.dead_letters().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].last_error, "e2");
    }
}
