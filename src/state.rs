//! Persistent pipeline state, stored in the artifact store.
//!
//! The state record of a document lives at the reserved artifact key
//! `{index}/{document_id}/pipeline.state` as self-describing JSON. The
//! record carries its own `schema_version`; loads reject versions newer
//! than this build understands and surface undecodable records as
//! data-integrity errors, which refuse processing rather than guessing.
//!
//! The artifact store's per-key atomicity gives `save` its atomicity for
//! free; the queue's one-lease-per-document rule is what makes
//! concurrent saves for the same key impossible in practice.

use std::sync::Arc;

use crate::artifacts::{self, ArtifactStore, STATE_ARTIFACT};
use crate::error::MemoryError;
use crate::models::{PipelineState, STATE_SCHEMA_VERSION};

pub struct StateStore {
    artifacts: Arc<dyn ArtifactStore>,
}

impl StateStore {
    pub fn new(artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self { artifacts }
    }

    fn key(index: &str, document_id: &str) -> String {
        artifacts::artifact_key(index, document_id, STATE_ARTIFACT)
    }

    /// Load a state record. `Ok(None)` when the document is unknown (or
    /// deleted); `DataIntegrity` when the record exists but cannot be
    /// trusted.
    pub async fn load(
        &self,
        index: &str,
        document_id: &str,
    ) -> Result<Option<PipelineState>, MemoryError> {
        let bytes = match self.artifacts.get(&Self::key(index, document_id)).await {
            Ok(bytes) => bytes,
            Err(MemoryError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let state: PipelineState = serde_json::from_slice(&bytes).map_err(|e| {
            MemoryError::DataIntegrity(format!(
                "corrupt pipeline state for '{index}/{document_id}': {e}"
            ))
        })?;
        if state.schema_version > STATE_SCHEMA_VERSION {
            return Err(MemoryError::DataIntegrity(format!(
                "pipeline state for '{index}/{document_id}' has schema version {} (this build reads up to {})",
                state.schema_version, STATE_SCHEMA_VERSION
            )));
        }
        Ok(Some(state))
    }

    pub async fn save(&self, state: &PipelineState) -> Result<(), MemoryError> {
        let bytes = serde_json::to_vec_pretty(state)
            .map_err(|e| MemoryError::transient(format!("encode pipeline state: {e}")))?;
        self.artifacts
            .put(&Self::key(&state.index, &state.document_id), &bytes)
            .await
    }

    pub async fn exists(&self, index: &str, document_id: &str) -> Result<bool, MemoryError> {
        self.artifacts.exists(&Self::key(index, document_id)).await
    }

    /// Remove only the state record, leaving other artifacts untouched.
    pub async fn delete(&self, index: &str, document_id: &str) -> Result<(), MemoryError> {
        self.artifacts
            .delete_prefix(&Self::key(index, document_id))
            .await
    }

    /// All state records under an index, ordered by document id.
    pub async fn list(&self, index: &str) -> Result<Vec<PipelineState>, MemoryError> {
        let prefix = format!("{index}/");
        let mut states = Vec::new();
        for key in self.artifacts.list(&prefix).await? {
            if !key.ends_with(&format!("/{STATE_ARTIFACT}")) {
                continue;
            }
            let parts: Vec<&str> = key.splitn(3, '/').collect();
            if let [idx, doc, _] = parts.as_slice() {
                if let Some(state) = self.load(idx, doc).await? {
                    states.push(state);
                }
            }
        }
        Ok(states)
    }

    /// Names of indexes that hold at least one document.
    pub async fn list_indexes(&self) -> Result<Vec<String>, MemoryError> {
        let mut indexes = Vec::new();
        for key in self.artifacts.list("").await? {
            if let Some(index) = key.split('/').next() {
                if !index.is_empty() && indexes.last().map(|l| l != index).unwrap_or(true) {
                    indexes.push(index.to_string());
                }
            }
        }
        indexes.dedup();
        Ok(indexes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::memory::MemoryArtifactStore;
    use crate::models::TagCollection;

    fn store() -> StateStore {
        StateStore::new(Arc::new(MemoryArtifactStore::new()))
    }

    fn state(index: &str, doc: &str) -> PipelineState {
        PipelineState::new(index, doc, TagCollection::new(), vec!["extract_text".into()])
    }

    #[tokio::test]
    async fn save_load_roundtrip() {
        let store = store();
        let original = state("idx", "doc");
        store.save(&original).await.unwrap();

        let loaded = store.load("idx", "doc").await.unwrap().unwrap();
        assert_eq!(loaded, original);
    }

    #[tokio::test]
    async fn missing_state_is_none() {
        let store = store();
        assert!(store.load("idx", "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_state_is_data_integrity() {
        let artifacts = Arc::new(MemoryArtifactStore::new());
        artifacts
            .put("idx/doc/pipeline.state", b"{not json")
            .await
            .unwrap();
        let store = StateStore::new(artifacts);
        assert!(matches!(
            store.load("idx", "doc").await,
            Err(MemoryError::DataIntegrity(_))
        ));
    }

    #[tokio::test]
    async fn newer_schema_version_rejected() {
        let artifacts = Arc::new(MemoryArtifactStore::new());
        let mut s = state("idx", "doc");
        s.schema_version = STATE_SCHEMA_VERSION + 1;
        let bytes = serde_json::to_vec(&s).unwrap();
        artifacts.put("idx/doc/pipeline.state", &bytes).await.unwrap();

        let store = StateStore::new(artifacts);
        assert!(matches!(
            store.load("idx", "doc").await,
            Err(MemoryError::DataIntegrity(_))
        ));
    }

    #[tokio::test]
    async fn list_and_list_indexes() {
        let store = store();
        store.save(&state("alpha", "d1")).await.unwrap();
        store.save(&state("alpha", "d2")).await.unwrap();
        store.save(&state("beta", "d3")).await.unwrap();

        let alpha = store.list("alpha").await.unwrap();
        assert_eq!(alpha.len(), 2);

        let indexes = store.list_indexes().await.unwrap();
        assert_eq!(indexes, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn delete_removes_only_state_record() {
        let artifacts = Arc::new(MemoryArtifactStore::new());
        artifacts.put("idx/doc/source.0.txt", b"x").await.unwrap();
        let store = StateStore::new(artifacts.clone());
        store.save(&state("idx", "doc")).await.unwrap();

        store.delete("idx", "doc").await.unwrap();
        assert!(store.load("idx", "doc").await.unwrap().is_none());
        assert!(artifacts.exists("idx/doc/source.0.txt").await.unwrap());
    }
}
