//! Core data models used throughout Memory Harness.
//!
//! These types represent the documents, tags, and pipeline state that flow
//! through ingestion and retrieval. The data lifecycle is:
//!
//! ```text
//! Upload → PipelineState + source artifacts → extract_text → partition_text
//!                                                  ↓
//!                                        generate_embeddings
//!                                                  ↓
//!                                  save_records → MemoryRecord (indexed)
//! ```
//!
//! # Type Relationships
//!
//! - A **[`TagCollection`]** is a multi-valued label set attached to a
//!   document and propagated verbatim to every chunk derived from it.
//! - A **[`MemoryFilter`]** is a conjunction of tag equality predicates;
//!   a list of filters is a disjunction of conjunctions (DNF).
//! - A **[`FileRef`]** records one uploaded file and the artifacts each
//!   pipeline step generated from it ([`GeneratedFile`]).
//! - A **[`PipelineState`]** is the persistent record of a document's
//!   progress: completed steps, remaining steps, files, tags, status.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MemoryError;

/// Automatic tag carrying the owning document id on every indexed chunk.
pub const TAG_DOCUMENT_ID: &str = "__document_id";
/// Automatic tag carrying the source file id on every indexed chunk.
pub const TAG_FILE_ID: &str = "__file_id";
/// Automatic tag carrying the partition number on every indexed chunk.
pub const TAG_FILE_PART: &str = "__file_part";

/// Tag keys starting with this prefix are reserved for the pipeline.
pub const RESERVED_TAG_PREFIX: &str = "__";

/// Current major version of the persisted [`PipelineState`] encoding.
/// Readers reject records with a newer version.
pub const STATE_SCHEMA_VERSION: u32 = 1;

// ═══════════════════════════════════════════════════════════════════════
// Tags and filters
// ═══════════════════════════════════════════════════════════════════════

/// Multi-valued string tags: a mapping from tag key to a set of values.
///
/// An empty value list means "key present with no value". Tags attached to
/// a document propagate verbatim to every chunk derived from it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagCollection(BTreeMap<String, Vec<String>>);

impl TagCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value under a key, creating the key if needed. Duplicate
    /// values under the same key are kept once.
    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let values = self.0.entry(key.into()).or_default();
        let value = value.into();
        if !values.contains(&value) {
            values.push(value);
        }
    }

    /// Mark a key as present with no value.
    pub fn add_key(&mut self, key: impl Into<String>) {
        self.0.entry(key.into()).or_default();
    }

    pub fn get(&self, key: &str) -> Option<&[String]> {
        self.0.get(key).map(|v| v.as_slice())
    }

    /// True when the key carries the given value.
    pub fn contains(&self, key: &str, value: &str) -> bool {
        self.0
            .get(key)
            .map(|values| values.iter().any(|v| v == value))
            .unwrap_or(false)
    }

    /// Copy every (key, value) pair from `other` into `self`.
    pub fn merge(&mut self, other: &TagCollection) {
        for (key, values) in &other.0 {
            if values.is_empty() {
                self.add_key(key.clone());
            }
            for value in values {
                self.add(key.clone(), value.clone());
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Vec<String>)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Reject user-supplied tags that collide with the pipeline's
    /// reserved `__` keys.
    pub fn validate_user_supplied(&self) -> Result<(), MemoryError> {
        for key in self.0.keys() {
            if key.starts_with(RESERVED_TAG_PREFIX) {
                return Err(MemoryError::validation(format!(
                    "tag key '{key}' uses the reserved '{RESERVED_TAG_PREFIX}' prefix"
                )));
            }
            if key.trim().is_empty() {
                return Err(MemoryError::validation("tag keys must not be empty"));
            }
        }
        Ok(())
    }
}

/// A conjunction of (tag key, tag value) equality predicates.
///
/// The empty filter matches everything. A slice of filters combines
/// disjunctively: a chunk matches when any single filter matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryFilter {
    pub pairs: Vec<(String, String)>,
}

impl MemoryFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style: add an equality predicate.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.pairs.push((key.into(), value.into()));
        self
    }

    pub fn by_document(document_id: &str) -> Self {
        Self::new().with(TAG_DOCUMENT_ID, document_id)
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// True when every predicate holds against the tag set.
    pub fn matches(&self, tags: &TagCollection) -> bool {
        self.pairs
            .iter()
            .all(|(key, value)| tags.contains(key, value))
    }
}

/// Disjunction over a filter list: an empty list (or any empty filter)
/// matches everything.
pub fn any_filter_matches(filters: &[MemoryFilter], tags: &TagCollection) -> bool {
    if filters.is_empty() {
        return true;
    }
    filters.iter().any(|f| f.matches(tags))
}

// ═══════════════════════════════════════════════════════════════════════
// Pipeline state
// ═══════════════════════════════════════════════════════════════════════

/// Lifecycle status of a document inside the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Pending,
    Processing,
    Complete,
    Failed,
    Cancelled,
}

impl PipelineStatus {
    /// Terminal states are never reprocessed by workers.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineStatus::Complete | PipelineStatus::Failed | PipelineStatus::Cancelled
        )
    }
}

/// Classification stored alongside a failure message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    Transient,
    Permanent,
    Poisoned,
    DataIntegrity,
}

/// Structured failure recorded on a `failed` document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureReason {
    pub kind: FailureKind,
    pub message: String,
}

/// An artifact generated from a source file by a pipeline step.
///
/// Descendants carry a back-pointer to their originating file id rather
/// than a shared reference, so the state record stays a flat document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    /// Name of the step that produced this artifact.
    pub step: String,
    /// Artifact store key of the generated content.
    pub artifact_key: String,
    /// MIME type of the generated content.
    pub content_type: String,
    /// Id of the source file this artifact descends from.
    pub parent_file_id: String,
}

/// One uploaded source file and everything the pipeline derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    /// Stable file id, unique within the document (`f0`, `f1`, ...).
    pub file_id: String,
    /// Original file name as uploaded.
    pub name: String,
    /// Artifact store key of the original bytes.
    pub artifact_key: String,
    /// Detected MIME type.
    pub content_type: String,
    /// Size of the original bytes.
    pub size: u64,
    /// Artifacts generated from this file, in production order.
    #[serde(default)]
    pub generated: Vec<GeneratedFile>,
}

impl FileRef {
    /// Descendants produced by the named step.
    pub fn generated_by<'a>(&'a self, step: &'a str) -> impl Iterator<Item = &'a GeneratedFile> + 'a {
        self.generated.iter().filter(move |g| g.step == step)
    }

    /// Record a descendant, keeping re-invoked handlers idempotent:
    /// an artifact key already present is not appended again.
    pub fn add_generated(&mut self, generated: GeneratedFile) {
        if !self
            .generated
            .iter()
            .any(|g| g.artifact_key == generated.artifact_key)
        {
            self.generated.push(generated);
        }
    }
}

/// Persistent record of a document's progress through the pipeline.
///
/// One record exists per (index, document id). It is mutated only by the
/// worker currently holding the queue lease for the document, and
/// persisted after every successful step.
///
/// Invariant: `steps_completed` is a prefix of the originally requested
/// sequence and `steps_to_execute` is the suffix.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    pub schema_version: u32,
    pub index: String,
    pub document_id: String,
    pub creation_time: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
    pub tags: TagCollection,
    pub files: Vec<FileRef>,
    pub steps_to_execute: Vec<String>,
    pub steps_completed: Vec<String>,
    /// Completion time of each executed step.
    #[serde(default)]
    pub step_timestamps: BTreeMap<String, DateTime<Utc>>,
    /// Highest queue delivery attempt observed while executing the
    /// current step. Lease expiry does not count as an attempt.
    #[serde(default)]
    pub attempt_count: u32,
    pub status: PipelineStatus,
    #[serde(default)]
    pub failure_reason: Option<FailureReason>,
}

impl PipelineState {
    pub fn new(
        index: impl Into<String>,
        document_id: impl Into<String>,
        tags: TagCollection,
        steps: Vec<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            index: index.into(),
            document_id: document_id.into(),
            creation_time: now,
            last_update_time: now,
            tags,
            files: Vec::new(),
            steps_to_execute: steps,
            steps_completed: Vec::new(),
            step_timestamps: BTreeMap::new(),
            attempt_count: 0,
            status: PipelineStatus::Pending,
            failure_reason: None,
        }
    }

    /// Name of the next step to execute, if any.
    pub fn next_step(&self) -> Option<&str> {
        self.steps_to_execute.first().map(|s| s.as_str())
    }

    /// Pop the head of `steps_to_execute` into `steps_completed`,
    /// stamping its completion time.
    pub fn complete_step(&mut self) -> Option<String> {
        if self.steps_to_execute.is_empty() {
            return None;
        }
        let step = self.steps_to_execute.remove(0);
        self.step_timestamps.insert(step.clone(), Utc::now());
        self.steps_completed.push(step.clone());
        self.touch();
        Some(step)
    }

    pub fn touch(&mut self) {
        self.last_update_time = Utc::now();
    }

    pub fn fail(&mut self, kind: FailureKind, message: impl Into<String>) {
        self.status = PipelineStatus::Failed;
        self.failure_reason = Some(FailureReason {
            kind,
            message: message.into(),
        });
        self.touch();
    }

    pub fn file(&self, file_id: &str) -> Option<&FileRef> {
        self.files.iter().find(|f| f.file_id == file_id)
    }

    pub fn file_mut(&mut self, file_id: &str) -> Option<&mut FileRef> {
        self.files.iter_mut().find(|f| f.file_id == file_id)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Index names
// ═══════════════════════════════════════════════════════════════════════

/// Canonicalise an index name: lowercase, trim, collapse runs of
/// characters outside `[a-z0-9-]` into a single hyphen, strip hyphens at
/// the edges. An empty input resolves to `default_index`; an input that
/// normalises to nothing is rejected.
pub fn normalize_index_name(raw: &str, default_index: &str) -> Result<String, MemoryError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(default_index.to_string());
    }

    let mut out = String::with_capacity(trimmed.len());
    let mut pending_hyphen = false;
    for ch in trimmed.chars().flat_map(|c| c.to_lowercase()) {
        if ch.is_ascii_alphanumeric() || ch == '-' {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.push(ch);
        } else {
            pending_hyphen = true;
        }
    }

    let out = out.trim_matches('-').to_string();
    if out.is_empty() {
        return Err(MemoryError::validation(format!(
            "index name '{raw}' is empty after normalisation"
        )));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_keep_one_copy_of_duplicate_values() {
        let mut tags = TagCollection::new();
        tags.add("user", "alice");
        tags.add("user", "alice");
        tags.add("user", "bob");
        assert_eq!(tags.get("user").unwrap(), &["alice", "bob"]);
    }

    #[test]
    fn key_without_value_is_present() {
        let mut tags = TagCollection::new();
        tags.add_key("draft");
        assert!(tags.get("draft").is_some());
        assert!(tags.get("draft").unwrap().is_empty());
    }

    #[test]
    fn reserved_prefix_rejected() {
        let mut tags = TagCollection::new();
        tags.add("__document_id", "x");
        assert!(tags.validate_user_supplied().is_err());
    }

    #[test]
    fn empty_filter_matches_everything() {
        let tags = TagCollection::new();
        assert!(MemoryFilter::new().matches(&tags));
        assert!(any_filter_matches(&[], &tags));
    }

    #[test]
    fn filter_pairs_combine_conjunctively() {
        let mut tags = TagCollection::new();
        tags.add("user", "alice");
        tags.add("type", "note");

        let both = MemoryFilter::new().with("user", "alice").with("type", "note");
        let wrong = MemoryFilter::new().with("user", "alice").with("type", "memo");
        assert!(both.matches(&tags));
        assert!(!wrong.matches(&tags));
    }

    #[test]
    fn filter_list_combines_disjunctively() {
        let mut tags = TagCollection::new();
        tags.add("user", "alice");

        let filters = vec![
            MemoryFilter::new().with("user", "bob"),
            MemoryFilter::new().with("user", "alice"),
        ];
        assert!(any_filter_matches(&filters, &tags));
    }

    #[test]
    fn complete_step_moves_head_and_stamps_time() {
        let mut state = PipelineState::new(
            "idx",
            "doc",
            TagCollection::new(),
            vec!["a".into(), "b".into()],
        );
        assert_eq!(state.next_step(), Some("a"));
        assert_eq!(state.complete_step().as_deref(), Some("a"));
        assert_eq!(state.steps_completed, vec!["a"]);
        assert_eq!(state.steps_to_execute, vec!["b"]);
        assert!(state.step_timestamps.contains_key("a"));
    }

    #[test]
    fn generated_files_dedupe_by_artifact_key() {
        let mut file = FileRef {
            file_id: "f0".into(),
            name: "a.txt".into(),
            artifact_key: "idx/doc/source.0.txt".into(),
            content_type: "text/plain".into(),
            size: 3,
            generated: Vec::new(),
        };
        let gen = GeneratedFile {
            step: "extract_text".into(),
            artifact_key: "idx/doc/extract_text.f0.0.txt".into(),
            content_type: "text/plain".into(),
            parent_file_id: "f0".into(),
        };
        file.add_generated(gen.clone());
        file.add_generated(gen);
        assert_eq!(file.generated.len(), 1);
    }

    #[test]
    fn index_name_normalisation() {
        assert_eq!(normalize_index_name("  My Index! ", "default").unwrap(), "my-index");
        assert_eq!(normalize_index_name("docs", "default").unwrap(), "docs");
        assert_eq!(normalize_index_name("", "default").unwrap(), "default");
        assert_eq!(normalize_index_name("a__b", "default").unwrap(), "a-b");
        assert!(normalize_index_name("!!!", "default").is_err());
    }

    #[test]
    fn state_roundtrips_through_json() {
        let mut state = PipelineState::new(
            "idx",
            "doc",
            TagCollection::new(),
            vec!["extract_text".into()],
        );
        state.fail(FailureKind::Permanent, "boom");
        let json = serde_json::to_string(&state).unwrap();
        let back: PipelineState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
