//! The in-process client contract.
//!
//! [`MemoryService`] ties the backends together and exposes everything a
//! caller can do: upload documents, poll status, cancel, delete, list
//! indexes, search, and ask. The HTTP layer ([`crate::server`]) and the
//! CLI are thin shells over this type.
//!
//! # Construction
//!
//! [`MemoryService::builder`] selects concrete backends from the
//! configuration (in-memory or filesystem artifact store and queue, the
//! configured embedding provider) and lets tests inject their own
//! implementations of any backend trait.
//!
//! # Validation
//!
//! All validation errors are synchronous: a bad index name, missing
//! files, an unknown step, a reserved tag key, or an oversized file is
//! reported to the caller and nothing is enqueued.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use crate::artifacts::disk::FsArtifactStore;
use crate::artifacts::memory::MemoryArtifactStore;
use crate::artifacts::{artifact_key, document_prefix, source_artifact_name, ArtifactStore};
use crate::cancel::CancelToken;
use crate::config::Config;
use crate::embedding::{create_provider, embed_query, EmbeddingProvider};
use crate::error::MemoryError;
use crate::extract::{detect_content_type, file_extension};
use crate::handlers::{default_steps, HandlerContext, HandlerRegistry};
use crate::index::memory::InMemoryIndex;
use crate::index::{MemoryIndex, SearchHit};
use crate::metrics::PipelineMetrics;
use crate::models::{
    normalize_index_name, FileRef, MemoryFilter, PipelineState, TagCollection,
};
use crate::orchestrator::Orchestrator;
use crate::queue::disk::FsQueue;
use crate::queue::memory::MemoryQueue;
use crate::queue::{JobMessage, JobQueue};
use crate::report::{project, DocumentStatus};
use crate::state::StateStore;

/// One file in an upload: original name plus raw bytes.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

/// An ingestion request.
#[derive(Debug, Clone, Default)]
pub struct UploadRequest {
    /// Index name; empty uses the configured default.
    pub index: String,
    /// Client-supplied document id; generated when absent. Stable across
    /// retries and re-ingestion of the same document.
    pub document_id: Option<String>,
    pub tags: TagCollection,
    /// Step plan; `None` uses the default sequence.
    pub steps: Option<Vec<String>>,
    pub files: Vec<UploadFile>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadReceipt {
    pub index: String,
    pub document_id: String,
}

#[derive(Debug, Clone, Default)]
pub struct SearchRequest {
    pub index: String,
    pub query: String,
    pub filters: Vec<MemoryFilter>,
    /// Lower score bound; `0.0` means unbounded.
    pub min_relevance: f32,
    /// `None` uses the configured default; `< 0` returns all matches.
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct AskRequest {
    pub index: String,
    pub question: String,
    pub filters: Vec<MemoryFilter>,
    pub min_relevance: f32,
}

/// A grounded answer assembled from retrieved chunks.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Answer {
    pub question: String,
    pub answer: String,
    pub citations: Vec<Citation>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Citation {
    pub document_id: String,
    pub file_id: String,
    pub part_index: usize,
    pub source_file: String,
    pub score: f32,
    pub snippet: String,
}

pub struct MemoryService {
    config: Arc<Config>,
    artifacts: Arc<dyn ArtifactStore>,
    queue: Arc<dyn JobQueue>,
    states: Arc<StateStore>,
    index: Arc<dyn MemoryIndex>,
    embedder: Arc<dyn EmbeddingProvider>,
    registry: Arc<HandlerRegistry>,
    metrics: Arc<PipelineMetrics>,
    cancel: CancelToken,
}

/// Builds a [`MemoryService`], selecting backends from configuration
/// unless explicitly injected.
pub struct MemoryServiceBuilder {
    config: Arc<Config>,
    artifacts: Option<Arc<dyn ArtifactStore>>,
    queue: Option<Arc<dyn JobQueue>>,
    index: Option<Arc<dyn MemoryIndex>>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    registry: Option<HandlerRegistry>,
    cancel: Option<CancelToken>,
}

impl MemoryServiceBuilder {
    pub fn artifacts(mut self, artifacts: Arc<dyn ArtifactStore>) -> Self {
        self.artifacts = Some(artifacts);
        self
    }

    pub fn queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn index(mut self, index: Arc<dyn MemoryIndex>) -> Self {
        self.index = Some(index);
        self
    }

    pub fn embedder(mut self, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    pub fn registry(mut self, registry: HandlerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn build(self) -> Result<MemoryService, MemoryError> {
        let config = self.config;

        let artifacts: Arc<dyn ArtifactStore> = match self.artifacts {
            Some(artifacts) => artifacts,
            None => match config.artifacts.backend.as_str() {
                "memory" => Arc::new(MemoryArtifactStore::new()),
                _ => Arc::new(FsArtifactStore::new(config.artifacts.root.clone())?),
            },
        };

        let queue: Arc<dyn JobQueue> = match self.queue {
            Some(queue) => queue,
            None => {
                let visibility = Duration::from_millis(config.queue.visibility_timeout_ms);
                match config.queue.backend.as_str() {
                    "memory" => Arc::new(MemoryQueue::new(visibility, config.queue.max_attempts)),
                    _ => Arc::new(FsQueue::new(
                        config.queue.root.clone(),
                        visibility,
                        config.queue.max_attempts,
                    )?),
                }
            }
        };

        let index: Arc<dyn MemoryIndex> = match self.index {
            Some(index) => index,
            None => Arc::new(InMemoryIndex::new()),
        };

        let embedder = match self.embedder {
            Some(embedder) => embedder,
            None => create_provider(&config.embedding)?,
        };

        let registry = Arc::new(self.registry.unwrap_or_else(HandlerRegistry::with_builtins));
        let states = Arc::new(StateStore::new(artifacts.clone()));
        let cancel = self.cancel.unwrap_or_else(CancelToken::never);

        Ok(MemoryService {
            config,
            artifacts,
            queue,
            states,
            index,
            embedder,
            registry,
            metrics: Arc::new(PipelineMetrics::new()),
            cancel,
        })
    }
}

impl MemoryService {
    pub fn builder(config: Config) -> MemoryServiceBuilder {
        MemoryServiceBuilder {
            config: Arc::new(config),
            artifacts: None,
            queue: None,
            index: None,
            embedder: None,
            registry: None,
            cancel: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn artifacts(&self) -> Arc<dyn ArtifactStore> {
        self.artifacts.clone()
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    /// Spawn the configured number of pipeline workers.
    pub fn start_workers(&self) -> Vec<JoinHandle<()>> {
        let ctx = HandlerContext {
            artifacts: self.artifacts.clone(),
            index: self.index.clone(),
            embedder: self.embedder.clone(),
            config: self.config.clone(),
            cancel: self.cancel.clone(),
        };
        let orchestrator = Arc::new(Orchestrator::new(
            self.queue.clone(),
            self.states.clone(),
            self.registry.clone(),
            ctx,
            self.metrics.clone(),
        ));
        orchestrator.spawn_workers(self.config.pipeline.workers)
    }

    /// Accept a document: validate, persist sources and state, enqueue
    /// the first step. Returns HTTP-202 semantics — acceptance, not
    /// completion.
    pub async fn upload(&self, req: UploadRequest) -> Result<UploadReceipt, MemoryError> {
        let index = normalize_index_name(&req.index, &self.config.service.default_index)?;
        req.tags.validate_user_supplied()?;

        if req.files.is_empty() {
            return Err(MemoryError::validation(
                "upload must contain at least one file",
            ));
        }
        for file in &req.files {
            if file.name.trim().is_empty() {
                return Err(MemoryError::validation("file names must not be empty"));
            }
            if file.bytes.len() as u64 > self.config.pipeline.max_file_bytes {
                return Err(MemoryError::validation(format!(
                    "file '{}' exceeds the {} byte limit",
                    file.name, self.config.pipeline.max_file_bytes
                )));
            }
        }

        let steps = match req.steps {
            Some(steps) if !steps.is_empty() => steps,
            _ => default_steps(),
        };
        for step in &steps {
            if !self.registry.contains(step) {
                return Err(MemoryError::validation(format!(
                    "unknown step '{}'; registered steps: {}",
                    step,
                    self.registry.names().join(", ")
                )));
            }
        }

        let document_id = match req.document_id {
            Some(id) if !id.trim().is_empty() => {
                validate_document_id(&id)?;
                id
            }
            _ => Uuid::new_v4().to_string(),
        };

        // Re-ingesting a terminal document replaces it; re-ingesting one
        // still in flight is rejected.
        if let Some(existing) = self.states.load(&index, &document_id).await? {
            if !existing.status.is_terminal() {
                return Err(MemoryError::validation(format!(
                    "document '{document_id}' is still being processed"
                )));
            }
            // Index records are replaced later by save_records, so
            // readers keep the old chunks until the new run completes.
            self.artifacts
                .delete_prefix(&document_prefix(&index, &document_id))
                .await?;
        }

        let mut state = PipelineState::new(&index, &document_id, req.tags, steps);
        for (n, file) in req.files.iter().enumerate() {
            let name = source_artifact_name(n, file_extension(&file.name));
            let key = artifact_key(&index, &document_id, &name);
            self.artifacts.put(&key, &file.bytes).await?;
            state.files.push(FileRef {
                file_id: format!("f{n}"),
                name: file.name.clone(),
                artifact_key: key,
                content_type: detect_content_type(&file.name).to_string(),
                size: file.bytes.len() as u64,
                generated: Vec::new(),
            });
        }

        self.states.save(&state).await?;
        self.queue
            .enqueue(JobMessage::new(index.clone(), document_id.clone()))
            .await?;
        PipelineMetrics::incr(&self.metrics.documents_accepted);
        info!(%index, %document_id, files = state.files.len(), "document accepted");

        Ok(UploadReceipt { index, document_id })
    }

    /// Status projection for one document.
    pub async fn status(&self, index: &str, document_id: &str) -> Result<DocumentStatus, MemoryError> {
        let index = normalize_index_name(index, &self.config.service.default_index)?;
        let state = self
            .states
            .load(&index, document_id)
            .await?
            .ok_or_else(|| {
                MemoryError::not_found(format!("document '{document_id}' in index '{index}'"))
            })?;
        Ok(project(&state))
    }

    /// True once the document completed every step of its plan.
    /// Unknown documents are simply not ready.
    pub async fn is_document_ready(&self, index: &str, document_id: &str) -> Result<bool, MemoryError> {
        match self.status(index, document_id).await {
            Ok(status) => Ok(status.ready),
            Err(MemoryError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Ask the next worker that touches this document to stop. Terminal
    /// documents are left as they are.
    pub async fn cancel_document(&self, index: &str, document_id: &str) -> Result<(), MemoryError> {
        let index = normalize_index_name(index, &self.config.service.default_index)?;
        let Some(mut state) = self.states.load(&index, document_id).await? else {
            return Ok(());
        };
        if state.status.is_terminal() {
            return Ok(());
        }
        state.status = crate::models::PipelineStatus::Cancelled;
        state.touch();
        self.states.save(&state).await?;
        PipelineMetrics::incr(&self.metrics.documents_cancelled);
        info!(%index, %document_id, "document cancelled");
        Ok(())
    }

    /// Remove a document: its index records, artifacts, and state.
    /// Idempotent; an in-flight worker detects the missing state at its
    /// next save and aborts.
    pub async fn delete_document(&self, index: &str, document_id: &str) -> Result<(), MemoryError> {
        let index = normalize_index_name(index, &self.config.service.default_index)?;
        self.index
            .delete_by_filter(&index, &[MemoryFilter::by_document(document_id)])
            .await?;
        self.artifacts
            .delete_prefix(&document_prefix(&index, document_id))
            .await?;
        info!(%index, %document_id, "document deleted");
        Ok(())
    }

    /// Drop an index wholesale: every document, artifact, and record.
    pub async fn delete_index(&self, index: &str) -> Result<(), MemoryError> {
        let index = normalize_index_name(index, &self.config.service.default_index)?;
        self.index.delete_index(&index).await?;
        self.artifacts.delete_prefix(&format!("{index}/")).await?;
        info!(%index, "index deleted");
        Ok(())
    }

    pub async fn list_indexes(&self) -> Result<Vec<String>, MemoryError> {
        self.states.list_indexes().await
    }

    /// Embed the query and return the nearest chunks.
    pub async fn search(&self, req: SearchRequest) -> Result<Vec<SearchHit>, MemoryError> {
        let index = normalize_index_name(&req.index, &self.config.service.default_index)?;
        if req.query.trim().is_empty() {
            return Ok(Vec::new());
        }
        let limit = req.limit.unwrap_or(self.config.search.default_limit);
        if limit == 0 {
            return Ok(Vec::new());
        }

        let vector = embed_query(self.embedder.as_ref(), &req.query).await?;
        self.index
            .search(&index, &vector, &req.filters, req.min_relevance, limit)
            .await
    }

    /// Retrieve the chunks most relevant to a question and assemble a
    /// grounded extractive answer with citations.
    pub async fn ask(&self, req: AskRequest) -> Result<Answer, MemoryError> {
        let hits = self
            .search(SearchRequest {
                index: req.index,
                query: req.question.clone(),
                filters: req.filters,
                min_relevance: req.min_relevance,
                limit: Some(self.config.search.ask_top_k as i64),
            })
            .await?;

        if hits.is_empty() {
            return Ok(Answer {
                question: req.question,
                answer: "No relevant memories were found.".to_string(),
                citations: Vec::new(),
            });
        }

        let answer = hits
            .iter()
            .take(3)
            .map(|h| h.record.text.trim())
            .collect::<Vec<_>>()
            .join("\n\n");
        let citations = hits
            .iter()
            .map(|h| Citation {
                document_id: h.record.document_id.clone(),
                file_id: h.record.file_id.clone(),
                part_index: h.record.part_index,
                source_file: h.record.source_file.clone(),
                score: h.score,
                snippet: snippet_of(&h.record.text, 200),
            })
            .collect();

        Ok(Answer {
            question: req.question,
            answer,
            citations,
        })
    }

    /// Pipeline state projections for every document in an index.
    pub async fn list_documents(&self, index: &str) -> Result<Vec<DocumentStatus>, MemoryError> {
        let index = normalize_index_name(index, &self.config.service.default_index)?;
        let states = self.states.list(&index).await?;
        Ok(states.iter().map(project).collect())
    }
}

/// Document ids become path segments in artifact keys, so they are
/// restricted to a filesystem-safe alphabet.
fn validate_document_id(id: &str) -> Result<(), MemoryError> {
    if id.len() > 256 {
        return Err(MemoryError::validation("document id too long"));
    }
    let valid = id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid || id.starts_with('.') {
        return Err(MemoryError::validation(format!(
            "document id '{id}' may only contain letters, digits, '-', '_' and '.'"
        )));
    }
    Ok(())
}

fn snippet_of(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(max_chars).collect();
    format!("{cut}…")
}
