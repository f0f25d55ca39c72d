//! Pipeline orchestration: the worker loop that drives documents
//! through their steps.
//!
//! Coordinates the full flow: dequeue → load state → invoke handler →
//! persist → enqueue continuation or completion. Workers are plain tokio
//! tasks running [`Orchestrator::worker_loop`]; any number of them, in
//! one process or many, can share the same queue and stores. The queue's
//! one-lease-per-document rule keeps execution strictly sequential per
//! document while documents proceed concurrently.
//!
//! # One turn of the loop
//!
//! 1. Dequeue a message; sleep with bounded backoff when idle.
//! 2. Load state. Missing state means the document was deleted: ack and
//!    move on. Terminal state (complete, failed, cancelled) or an empty
//!    step list: ack — completion is idempotent.
//! 3. Mark `processing`, record the delivery attempt, persist.
//! 4. Look up the head step's handler; an unregistered step fails the
//!    document immediately.
//! 5. Invoke the handler under its soft deadline.
//! 6. Interpret the outcome: advance (persist, re-enqueue or complete),
//!    retry (nack with exponential backoff + jitter), or fail.
//!
//! Handler errors never escape the loop: transient ones become retries
//! and the queue's dead-letter path turns repeated failure into a
//! `failed` document with a `poisoned:` reason. Infrastructure errors
//! (state store down) leave the lease unsettled so the message
//! reappears, attempt count unchanged, once the lease expires.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::artifacts;
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::error::MemoryError;
use crate::handlers::{HandlerContext, HandlerRegistry, StepOutcome};
use crate::metrics::PipelineMetrics;
use crate::models::{FailureKind, PipelineStatus};
use crate::queue::{JobMessage, JobQueue, LeasedJob, NackOutcome};
use crate::state::StateStore;

pub struct Orchestrator {
    queue: Arc<dyn JobQueue>,
    states: Arc<StateStore>,
    registry: Arc<HandlerRegistry>,
    handler_ctx: HandlerContext,
    metrics: Arc<PipelineMetrics>,
    config: Arc<Config>,
    cancel: CancelToken,
}

/// Result of persisting state mid-flight.
enum Persist {
    Saved,
    /// The state record vanished: the document was deleted while this
    /// worker held the lease.
    Gone,
    /// An external cancel landed between our load and this save; the
    /// cancelled record wins and this worker stands down.
    Superseded,
}

/// Internal classification of a handler invocation's result.
enum Disposition {
    Advance,
    Retry { reason: String, min_delay: Duration },
    Fail { kind: FailureKind, message: String },
    /// Leave the lease unsettled (shutdown drain); the message
    /// reappears after lease expiry with its attempt count unchanged.
    Release,
}

impl Orchestrator {
    pub fn new(
        queue: Arc<dyn JobQueue>,
        states: Arc<StateStore>,
        registry: Arc<HandlerRegistry>,
        handler_ctx: HandlerContext,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        let config = handler_ctx.config.clone();
        let cancel = handler_ctx.cancel.clone();
        Self {
            queue,
            states,
            registry,
            handler_ctx,
            metrics,
            config,
            cancel,
        }
    }

    /// Spawn `count` worker tasks sharing this orchestrator.
    pub fn spawn_workers(self: &Arc<Self>, count: usize) -> Vec<JoinHandle<()>> {
        (0..count)
            .map(|worker| {
                let this = Arc::clone(self);
                tokio::spawn(async move { this.worker_loop(worker).await })
            })
            .collect()
    }

    /// One consumer loop. Runs until cancellation; finishes the current
    /// handler invocation before stopping.
    pub async fn worker_loop(&self, worker: usize) {
        let poll = Duration::from_millis(self.config.queue.poll_interval_ms.max(1));
        let max_idle = poll.max(Duration::from_secs(1));
        let mut idle = poll;

        debug!(worker, "worker started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.queue.dequeue().await {
                Ok(Some(job)) => {
                    idle = poll;
                    self.process(job).await;
                }
                Ok(None) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(idle) => {}
                    }
                    idle = (idle * 2).min(max_idle);
                }
                Err(e) => {
                    warn!(worker, error = %e, "queue dequeue failed; backing off");
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(max_idle) => {}
                    }
                }
            }
        }
        debug!(worker, "worker stopped");
    }

    /// Drive one leased message through a single step.
    async fn process(&self, job: LeasedJob) {
        let message = &job.message;
        let index = message.index.as_str();
        let document_id = message.document_id.as_str();

        let mut state = match self.states.load(index, document_id).await {
            Ok(Some(state)) => state,
            Ok(None) => {
                // Deleted while queued; nothing left to do.
                let _ = self.queue.ack(&job.lease).await;
                return;
            }
            Err(MemoryError::DataIntegrity(e)) => {
                // Refuse to process; the record stays for manual repair.
                error!(index, document_id, error = %e, "corrupt pipeline state");
                let _ = self.queue.ack(&job.lease).await;
                return;
            }
            Err(e) => {
                // Infrastructure error: leave the lease unsettled so the
                // message reappears without an attempt increment.
                warn!(index, document_id, error = %e, "state load failed");
                return;
            }
        };

        if state.status.is_terminal() || state.steps_to_execute.is_empty() {
            let _ = self.queue.ack(&job.lease).await;
            return;
        }

        state.status = PipelineStatus::Processing;
        state.attempt_count = state.attempt_count.max(message.attempt + 1);
        state.touch();
        match self.persist(&state).await {
            Ok(Persist::Saved) => {}
            Ok(Persist::Gone) => {
                self.abort_deleted(&job).await;
                return;
            }
            Ok(Persist::Superseded) => {
                let _ = self.queue.ack(&job.lease).await;
                return;
            }
            Err(e) => {
                warn!(index, document_id, error = %e, "state save failed");
                return;
            }
        }

        let step = match state.next_step() {
            Some(step) => step.to_string(),
            None => {
                let _ = self.queue.ack(&job.lease).await;
                return;
            }
        };

        let Some(handler) = self.registry.get(&step) else {
            // Ingress validation normally catches this; a state written
            // by a deployment with more handlers can still reach here.
            state.fail(
                FailureKind::Validation,
                format!("no handler registered for step '{step}'"),
            );
            PipelineMetrics::incr(&self.metrics.documents_failed);
            if matches!(self.persist(&state).await, Ok(Persist::Gone)) {
                self.abort_deleted(&job).await;
                return;
            }
            let _ = self.queue.ack(&job.lease).await;
            return;
        };

        let deadline = handler
            .soft_deadline()
            .unwrap_or(Duration::from_millis(self.config.pipeline.handler_deadline_ms));
        PipelineMetrics::incr(&self.metrics.steps_executed);
        let invoked =
            tokio::time::timeout(deadline, handler.invoke(&self.handler_ctx, &mut state)).await;

        let disposition = match invoked {
            Err(_elapsed) => Disposition::Retry {
                reason: format!("step '{step}' exceeded its soft deadline"),
                min_delay: Duration::ZERO,
            },
            Ok(Ok(StepOutcome::Advance)) => Disposition::Advance,
            Ok(Ok(StepOutcome::RetryLater(min_delay))) => {
                if self.cancel.is_cancelled() {
                    Disposition::Release
                } else {
                    Disposition::Retry {
                        reason: format!("step '{step}' requested retry"),
                        min_delay,
                    }
                }
            }
            Ok(Ok(StepOutcome::Fatal(message))) => Disposition::Fail {
                kind: FailureKind::Permanent,
                message,
            },
            Ok(Err(e)) => self.classify_error(e),
        };

        match disposition {
            Disposition::Advance => self.advance(&job, state, &step).await,
            Disposition::Retry { reason, min_delay } => {
                self.retry(&job, state, &step, reason, min_delay).await
            }
            Disposition::Fail { kind, message } => {
                warn!(index, document_id, step, %message, "step failed permanently");
                self.fail(&job, state, kind, message).await
            }
            Disposition::Release => {
                debug!(index, document_id, step, "released lease for shutdown");
            }
        }
    }

    fn classify_error(&self, error: MemoryError) -> Disposition {
        match error {
            // A missing artifact usually means the document is being
            // deleted; the retry resolves either way.
            MemoryError::Transient(m) | MemoryError::NotFound(m) => Disposition::Retry {
                reason: m,
                min_delay: Duration::ZERO,
            },
            MemoryError::Validation(m) => Disposition::Fail {
                kind: FailureKind::Validation,
                message: m,
            },
            MemoryError::DataIntegrity(m) => Disposition::Fail {
                kind: FailureKind::DataIntegrity,
                message: m,
            },
            MemoryError::Poisoned(m) => Disposition::Fail {
                kind: FailureKind::Poisoned,
                message: m,
            },
            MemoryError::Permanent(m) => Disposition::Fail {
                kind: FailureKind::Permanent,
                message: m,
            },
        }
    }

    async fn advance(&self, job: &LeasedJob, mut state: crate::models::PipelineState, step: &str) {
        state.complete_step();
        let finished = state.steps_to_execute.is_empty();
        if finished {
            state.status = PipelineStatus::Complete;
            state.touch();
        }

        match self.persist(&state).await {
            Ok(Persist::Saved) => {}
            Ok(Persist::Gone) => {
                self.abort_deleted(job).await;
                return;
            }
            Ok(Persist::Superseded) => {
                let _ = self.queue.ack(&job.lease).await;
                return;
            }
            Err(e) => {
                // Redelivery re-runs the step; idempotent handlers make
                // that safe.
                warn!(error = %e, "state save failed after step");
                return;
            }
        }

        if finished {
            PipelineMetrics::incr(&self.metrics.documents_completed);
            info!(
                index = %state.index,
                document_id = %state.document_id,
                "document complete"
            );
            let _ = self.queue.ack(&job.lease).await;
            return;
        }

        debug!(
            index = %state.index,
            document_id = %state.document_id,
            step,
            "step complete"
        );
        let continuation = JobMessage::new(state.index.clone(), state.document_id.clone());
        if let Err(e) = self.queue.enqueue(continuation).await {
            // No ack: the lease expires and this message comes back with
            // the step already completed, which re-enqueues cleanly.
            warn!(error = %e, "failed to enqueue continuation");
            return;
        }
        let _ = self.queue.ack(&job.lease).await;
    }

    async fn retry(
        &self,
        job: &LeasedJob,
        state: crate::models::PipelineState,
        step: &str,
        reason: String,
        min_delay: Duration,
    ) {
        PipelineMetrics::incr(&self.metrics.steps_retried);
        // Persist without touching the step lists; tags or descendants
        // added before the retry point survive.
        match self.persist(&state).await {
            Ok(Persist::Saved) => {}
            Ok(Persist::Gone) => {
                self.abort_deleted(job).await;
                return;
            }
            Ok(Persist::Superseded) => {
                let _ = self.queue.ack(&job.lease).await;
                return;
            }
            Err(e) => {
                warn!(error = %e, "state save failed before retry");
                return;
            }
        }

        let delay = min_delay.max(self.backoff_delay(job.message.attempt));
        debug!(
            index = %state.index,
            document_id = %state.document_id,
            step,
            attempt = job.message.attempt,
            delay_ms = delay.as_millis() as u64,
            %reason,
            "step retried"
        );

        match self.queue.nack(&job.lease, delay, &reason).await {
            Ok(NackOutcome::Requeued) => {}
            Ok(NackOutcome::DeadLettered) => {
                PipelineMetrics::incr(&self.metrics.dead_letters);
                let mut state = state;
                state.fail(FailureKind::Poisoned, format!("poisoned: {reason}"));
                PipelineMetrics::incr(&self.metrics.documents_failed);
                error!(
                    index = %state.index,
                    document_id = %state.document_id,
                    step,
                    %reason,
                    "message dead-lettered"
                );
                match self.persist(&state).await {
                    Ok(Persist::Saved) | Ok(Persist::Superseded) => {}
                    Ok(Persist::Gone) => self.abort_deleted(job).await,
                    Err(e) => warn!(error = %e, "failed to record poisoned state"),
                }
            }
            Err(e) => {
                warn!(error = %e, "nack failed; lease will expire");
            }
        }
    }

    async fn fail(
        &self,
        job: &LeasedJob,
        mut state: crate::models::PipelineState,
        kind: FailureKind,
        message: String,
    ) {
        state.fail(kind, message);
        PipelineMetrics::incr(&self.metrics.documents_failed);
        match self.persist(&state).await {
            Ok(Persist::Saved) | Ok(Persist::Superseded) | Err(_) => {}
            Ok(Persist::Gone) => {
                self.abort_deleted(job).await;
                return;
            }
        }
        let _ = self.queue.ack(&job.lease).await;
    }

    /// Persist state, detecting the two external mutations that may race
    /// the lease holder: deletion and cancellation.
    async fn persist(
        &self,
        state: &crate::models::PipelineState,
    ) -> Result<Persist, MemoryError> {
        match self.states.load(&state.index, &state.document_id).await? {
            None => return Ok(Persist::Gone),
            Some(current)
                if current.status == PipelineStatus::Cancelled
                    && state.status != PipelineStatus::Cancelled =>
            {
                return Ok(Persist::Superseded)
            }
            Some(_) => {}
        }
        self.states.save(state).await?;
        Ok(Persist::Saved)
    }

    /// The document was deleted under us: drop anything this invocation
    /// wrote back under its prefix and settle the lease without
    /// re-enqueueing.
    async fn abort_deleted(&self, job: &LeasedJob) {
        let prefix = artifacts::document_prefix(&job.message.index, &job.message.document_id);
        if let Err(e) = self.handler_ctx.artifacts.delete_prefix(&prefix).await {
            warn!(error = %e, "cleanup after delete failed");
        }
        info!(
            index = %job.message.index,
            document_id = %job.message.document_id,
            "aborted step for deleted document"
        );
        let _ = self.queue.ack(&job.lease).await;
    }

    /// Exponential backoff with ±20% jitter: base·2^attempt, capped.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base = self.config.pipeline.retry_base_ms.max(1);
        let cap = self.config.pipeline.retry_cap_ms.max(base);
        let exp = base.saturating_mul(1u64 << attempt.min(16)).min(cap);
        let jitter = rand::thread_rng().gen_range(0.8..=1.2);
        Duration::from_millis(((exp as f64) * jitter).round() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::artifacts::memory::MemoryArtifactStore;
    use crate::cancel::cancel_pair;
    use crate::embedding::DisabledProvider;
    use crate::handlers::StepHandler;
    use crate::index::memory::InMemoryIndex;
    use crate::models::{PipelineState, TagCollection};
    use crate::queue::memory::MemoryQueue;

    struct CountingHandler {
        step: &'static str,
        failures_before_success: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl StepHandler for CountingHandler {
        fn name(&self) -> &str {
            self.step
        }
        async fn invoke(
            &self,
            _ctx: &HandlerContext,
            _state: &mut PipelineState,
        ) -> Result<StepOutcome, MemoryError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures_before_success {
                Err(MemoryError::transient("injected failure"))
            } else {
                Ok(StepOutcome::Advance)
            }
        }
    }

    struct Harness {
        orchestrator: Arc<Orchestrator>,
        states: Arc<StateStore>,
        queue: Arc<MemoryQueue>,
        _cancel: crate::cancel::CancelHandle,
    }

    fn harness(registry: HandlerRegistry) -> Harness {
        let mut config = Config::default();
        config.pipeline.retry_base_ms = 2;
        config.pipeline.retry_cap_ms = 20;
        let config = Arc::new(config);

        let artifacts = Arc::new(MemoryArtifactStore::new());
        let states = Arc::new(StateStore::new(artifacts.clone()));
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(30), 20));
        let (handle, token) = cancel_pair();

        let ctx = HandlerContext {
            artifacts,
            index: Arc::new(InMemoryIndex::new()),
            embedder: Arc::new(DisabledProvider),
            config,
            cancel: token,
        };
        let orchestrator = Arc::new(Orchestrator::new(
            queue.clone(),
            states.clone(),
            Arc::new(registry),
            ctx,
            Arc::new(PipelineMetrics::new()),
        ));
        Harness {
            orchestrator,
            states,
            queue,
            _cancel: handle,
        }
    }

    async fn drain(harness: &Harness) {
        // Single worker, driven until the queue stays empty.
        for _ in 0..200 {
            match harness.orchestrator.queue.dequeue().await.unwrap() {
                Some(job) => harness.orchestrator.process(job).await,
                None => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        }
    }

    async fn seed(harness: &Harness, steps: Vec<String>) {
        let state = PipelineState::new("idx", "doc", TagCollection::new(), steps);
        harness.states.save(&state).await.unwrap();
        harness
            .queue
            .enqueue(JobMessage::new("idx", "doc"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn advances_through_all_steps() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(CountingHandler {
            step: "one",
            failures_before_success: 0,
            calls: AtomicU32::new(0),
        }));
        registry.register(Arc::new(CountingHandler {
            step: "two",
            failures_before_success: 0,
            calls: AtomicU32::new(0),
        }));

        let h = harness(registry);
        seed(&h, vec!["one".into(), "two".into()]).await;
        drain(&h).await;

        let state = h.states.load("idx", "doc").await.unwrap().unwrap();
        assert_eq!(state.status, PipelineStatus::Complete);
        assert_eq!(state.steps_completed, vec!["one", "two"]);
        assert!(state.steps_to_execute.is_empty());
    }

    #[tokio::test]
    async fn transient_failures_retry_and_record_attempts() {
        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(CountingHandler {
            step: "flaky",
            failures_before_success: 3,
            calls: AtomicU32::new(0),
        }));

        let h = harness(registry);
        seed(&h, vec!["flaky".into()]).await;
        drain(&h).await;

        let state = h.states.load("idx", "doc").await.unwrap().unwrap();
        assert_eq!(state.status, PipelineStatus::Complete);
        assert!(state.attempt_count >= 4, "attempts = {}", state.attempt_count);
    }

    #[tokio::test]
    async fn unknown_step_fails_document() {
        let h = harness(HandlerRegistry::new());
        seed(&h, vec!["mystery".into()]).await;
        drain(&h).await;

        let state = h.states.load("idx", "doc").await.unwrap().unwrap();
        assert_eq!(state.status, PipelineStatus::Failed);
        let reason = state.failure_reason.unwrap();
        assert!(reason.message.contains("mystery"));
    }

    #[tokio::test]
    async fn permanent_error_fails_document() {
        struct Broken;
        #[async_trait]
        impl StepHandler for Broken {
            fn name(&self) -> &str {
                "broken"
            }
            async fn invoke(
                &self,
                _ctx: &HandlerContext,
                _state: &mut PipelineState,
            ) -> Result<StepOutcome, MemoryError> {
                Err(MemoryError::permanent("cannot process this input"))
            }
        }

        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(Broken));
        let h = harness(registry);
        seed(&h, vec!["broken".into()]).await;
        drain(&h).await;

        let state = h.states.load("idx", "doc").await.unwrap().unwrap();
        assert_eq!(state.status, PipelineStatus::Failed);
        assert!(state
            .failure_reason
            .unwrap()
            .message
            .contains("cannot process this input"));
    }

    #[tokio::test]
    async fn poison_marks_state_failed() {
        let mut config = Config::default();
        config.pipeline.retry_base_ms = 1;
        config.pipeline.retry_cap_ms = 2;
        let config = Arc::new(config);

        let artifacts = Arc::new(MemoryArtifactStore::new());
        let states = Arc::new(StateStore::new(artifacts.clone()));
        // Two nacks allowed; third failure dead-letters.
        let queue = Arc::new(MemoryQueue::new(Duration::from_secs(30), 2));
        let (_handle, token) = cancel_pair();

        let mut registry = HandlerRegistry::new();
        registry.register(Arc::new(CountingHandler {
            step: "hopeless",
            failures_before_success: u32::MAX,
            calls: AtomicU32::new(0),
        }));

        let ctx = HandlerContext {
            artifacts,
            index: Arc::new(InMemoryIndex::new()),
            embedder: Arc::new(DisabledProvider),
            config,
            cancel: token,
        };
        let orchestrator = Arc::new(Orchestrator::new(
            queue.clone(),
            states.clone(),
            Arc::new(registry),
            ctx,
            Arc::new(PipelineMetrics::new()),
        ));
        let h = Harness {
            orchestrator,
            states,
            queue,
            _cancel: _handle,
        };

        seed(&h, vec!["hopeless".into()]).await;
        drain(&h).await;

        let state = h.states.load("idx", "doc").await.unwrap().unwrap();
        assert_eq!(state.status, PipelineStatus::Failed);
        let reason = state.failure_reason.unwrap();
        assert_eq!(reason.kind, FailureKind::Poisoned);
        assert!(reason.message.starts_with("poisoned:"));
        assert_eq!(h.queue.dead_letters().await.unwrap().len(), 1);
    }
}
