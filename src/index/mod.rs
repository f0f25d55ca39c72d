//! Retrieval index abstraction.
//!
//! The final pipeline step writes [`MemoryRecord`]s into a
//! [`MemoryIndex`]; search embeds the query and asks the index for the
//! nearest records. The trait is a capability set, not a database
//! contract — backends range from the in-memory map used in tests and
//! single-node deployments ([`memory`]) to external vector stores.
//!
//! # Semantics
//!
//! - `search` orders by cosine similarity descending.
//! - `min_score` is a lower bound; `0.0` (or below) means no bound.
//! - `limit < 0` returns every match; `limit == 0` returns nothing.
//! - Filters combine disjunctively across the list; each filter's pairs
//!   combine conjunctively ([`crate::models::any_filter_matches`]).

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::MemoryError;
use crate::models::{MemoryFilter, TagCollection};

/// One retrievable chunk: text, provenance, tags, and a dense vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Deterministic id: `{document_id}/{file_id}/{part_index}`.
    pub id: String,
    pub index: String,
    pub document_id: String,
    pub file_id: String,
    pub part_index: usize,
    /// Original file name the chunk descends from.
    pub source_file: String,
    pub text: String,
    pub vector: Vec<f32>,
    /// Document tags plus the automatic `__document_id`, `__file_id`,
    /// and `__file_part` tags.
    pub tags: TagCollection,
}

/// A search match with its cosine similarity score.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub record: MemoryRecord,
    pub score: f32,
}

#[async_trait]
pub trait MemoryIndex: Send + Sync {
    /// Insert or replace records by id.
    async fn upsert(&self, records: Vec<MemoryRecord>) -> Result<(), MemoryError>;

    /// Delete every record in `index` matching the filter list.
    /// Returns the number of records removed.
    async fn delete_by_filter(
        &self,
        index: &str,
        filters: &[MemoryFilter],
    ) -> Result<usize, MemoryError>;

    /// Drop an entire index. Idempotent.
    async fn delete_index(&self, index: &str) -> Result<(), MemoryError>;

    /// Ranked nearest records for a query vector.
    async fn search(
        &self,
        index: &str,
        vector: &[f32],
        filters: &[MemoryFilter],
        min_score: f32,
        limit: i64,
    ) -> Result<Vec<SearchHit>, MemoryError>;
}
