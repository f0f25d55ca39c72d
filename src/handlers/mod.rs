//! Pipeline step handlers and their registry.
//!
//! A step is a named stage in the ingestion pipeline; a handler is its
//! implementation. The orchestrator looks handlers up by name in the
//! process-wide [`HandlerRegistry`], built once at startup.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │               HandlerRegistry                │
//! │  ┌──────────┐ ┌───────────┐ ┌─────────────┐ │
//! │  │ extract  │ │ partition │ │ embed/save  │ │
//! │  │  _text   │ │  _text    │ │  _records   │ │
//! │  └──────────┘ └───────────┘ └─────────────┘ │
//! └──────────────────┬───────────────────────────┘
//!                    ▼
//!            worker loop → invoke()
//! ```
//!
//! # Handler contract
//!
//! `invoke` receives the mutable pipeline state and returns a
//! [`StepOutcome`]. Handlers may read and write the artifact store,
//! append descendants and tags to the state, and must never remove
//! completed steps. Because artifact keys are deterministic functions of
//! (document, file, step, part), a handler re-invoked after a crash
//! overwrites its own prior output and advances — idempotence by
//! construction.
//!
//! Typed errors propagate to the orchestrator boundary, which maps
//! `Transient` to a backoff retry and everything else to a document
//! failure; a handler error never crashes a worker.

pub mod embed;
pub mod extract;
pub mod partition;
pub mod store;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::artifacts::ArtifactStore;
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::embedding::EmbeddingProvider;
use crate::error::MemoryError;
use crate::index::MemoryIndex;
use crate::models::PipelineState;

pub const STEP_EXTRACT: &str = "extract_text";
pub const STEP_PARTITION: &str = "partition_text";
pub const STEP_EMBED: &str = "generate_embeddings";
pub const STEP_SAVE: &str = "save_records";

/// The step sequence used when an upload names none.
pub fn default_steps() -> Vec<String> {
    vec![
        STEP_EXTRACT.to_string(),
        STEP_PARTITION.to_string(),
        STEP_EMBED.to_string(),
        STEP_SAVE.to_string(),
    ]
}

/// What the orchestrator should do after a handler invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// The step finished; move it to `steps_completed` and continue.
    Advance,
    /// Not done yet; re-deliver after at least this delay. The
    /// orchestrator applies its exponential backoff floor on top.
    RetryLater(Duration),
    /// The input cannot be processed; fail the document.
    Fatal(String),
}

/// Backends and configuration a handler may use. One context is shared
/// by all workers; everything in it is cheap to clone or immutable.
#[derive(Clone)]
pub struct HandlerContext {
    pub artifacts: Arc<dyn ArtifactStore>,
    pub index: Arc<dyn MemoryIndex>,
    pub embedder: Arc<dyn EmbeddingProvider>,
    pub config: Arc<Config>,
    pub cancel: CancelToken,
}

#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Step name this handler serves (e.g. `"extract_text"`).
    fn name(&self) -> &str;

    /// Soft deadline for one invocation. `None` uses
    /// `pipeline.handler_deadline_ms`; overrun is treated as a retry.
    fn soft_deadline(&self) -> Option<Duration> {
        None
    }

    /// Run the step against the current state.
    async fn invoke(
        &self,
        ctx: &HandlerContext,
        state: &mut PipelineState,
    ) -> Result<StepOutcome, MemoryError>;
}

/// Process-wide mapping from step name to handler.
///
/// Registration happens at startup; the registry is immutable afterwards
/// and shared read-only across workers.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry pre-loaded with the built-in steps.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(extract::TextExtractionHandler));
        registry.register(Arc::new(partition::TextPartitioningHandler));
        registry.register(Arc::new(embed::EmbeddingGenerationHandler));
        registry.register(Arc::new(store::SaveRecordsHandler));
        registry
    }

    /// Register a handler under its own name. Later registrations win,
    /// so built-ins can be overridden.
    pub fn register(&mut self, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(handler.name().to_string(), handler);
    }

    pub fn get(&self, step: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(step).cloned()
    }

    pub fn contains(&self, step: &str) -> bool {
        self.handlers.contains_key(step)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Part index encoded in a step artifact name
/// (`{step}.{file_id}.{part}.{ext}`).
pub(crate) fn part_index_of(artifact_key: &str) -> Option<usize> {
    let name = artifact_key.rsplit('/').next()?;
    let segments: Vec<&str> = name.split('.').collect();
    if segments.len() < 4 {
        return None;
    }
    segments[segments.len() - 2].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered() {
        let registry = HandlerRegistry::with_builtins();
        for step in default_steps() {
            assert!(registry.contains(&step), "missing builtin {step}");
        }
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn later_registration_overrides() {
        struct Noop;
        #[async_trait]
        impl StepHandler for Noop {
            fn name(&self) -> &str {
                STEP_EXTRACT
            }
            async fn invoke(
                &self,
                _ctx: &HandlerContext,
                _state: &mut PipelineState,
            ) -> Result<StepOutcome, MemoryError> {
                Ok(StepOutcome::Advance)
            }
        }

        let mut registry = HandlerRegistry::with_builtins();
        registry.register(Arc::new(Noop));
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn part_index_parses_from_artifact_key() {
        assert_eq!(part_index_of("idx/doc/partition_text.f0.2.txt"), Some(2));
        assert_eq!(part_index_of("partition_text.f1.0.txt"), Some(0));
        assert_eq!(part_index_of("idx/doc/source.0.txt"), None);
        assert_eq!(part_index_of("idx/doc/pipeline.state"), None);
    }
}
