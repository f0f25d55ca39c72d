//! In-memory [`MemoryIndex`] implementation.
//!
//! Brute-force cosine similarity over all stored vectors behind a
//! `std::sync::RwLock`. Fine for tests and single-node deployments with
//! modest corpora; larger deployments plug in an external vector store.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::MemoryError;
use crate::models::{any_filter_matches, MemoryFilter};

use super::{MemoryIndex, MemoryRecord, SearchHit};

#[derive(Default)]
pub struct InMemoryIndex {
    /// index name → record id → record
    records: RwLock<HashMap<String, HashMap<String, MemoryRecord>>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_err() -> MemoryError {
        MemoryError::transient("memory index lock poisoned")
    }
}

#[async_trait]
impl MemoryIndex for InMemoryIndex {
    async fn upsert(&self, records: Vec<MemoryRecord>) -> Result<(), MemoryError> {
        let mut store = self.records.write().map_err(|_| Self::lock_err())?;
        for record in records {
            store
                .entry(record.index.clone())
                .or_default()
                .insert(record.id.clone(), record);
        }
        Ok(())
    }

    async fn delete_by_filter(
        &self,
        index: &str,
        filters: &[MemoryFilter],
    ) -> Result<usize, MemoryError> {
        let mut store = self.records.write().map_err(|_| Self::lock_err())?;
        let Some(records) = store.get_mut(index) else {
            return Ok(0);
        };
        let before = records.len();
        records.retain(|_, r| !any_filter_matches(filters, &r.tags));
        Ok(before - records.len())
    }

    async fn delete_index(&self, index: &str) -> Result<(), MemoryError> {
        let mut store = self.records.write().map_err(|_| Self::lock_err())?;
        store.remove(index);
        Ok(())
    }

    async fn search(
        &self,
        index: &str,
        vector: &[f32],
        filters: &[MemoryFilter],
        min_score: f32,
        limit: i64,
    ) -> Result<Vec<SearchHit>, MemoryError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let store = self.records.read().map_err(|_| Self::lock_err())?;
        let Some(records) = store.get(index) else {
            return Ok(Vec::new());
        };

        let mut hits: Vec<SearchHit> = records
            .values()
            .filter(|r| any_filter_matches(filters, &r.tags))
            .map(|r| SearchHit {
                score: cosine_similarity(vector, &r.vector),
                record: r.clone(),
            })
            .filter(|h| min_score <= 0.0 || h.score >= min_score)
            .collect();

        // Cosine descending; ties broken by record id for determinism.
        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });

        if limit > 0 {
            hits.truncate(limit as usize);
        }
        Ok(hits)
    }
}
