//! Content-addressed blob storage for pipeline artifacts.
//!
//! Every byte blob a handler produces or consumes lives in an
//! [`ArtifactStore`], keyed by a hierarchical string of the form
//! `{index}/{document_id}/{artifact_name}`. Keys are immutable once
//! written: handlers mutate by writing new keys and updating the state
//! record's descendants, never by rewriting in place with different
//! content. Because artifact names are deterministic functions of
//! (document, file, step, part), a re-invoked handler overwrites its own
//! prior output byte-for-byte, which keeps steps idempotent.
//!
//! # Backends
//!
//! | Backend | Module | Use |
//! |---------|--------|-----|
//! | In-memory map | [`memory`] | tests, single-process |
//! | Local filesystem | [`disk`] | durable single-node |
//!
//! `put` is atomic per key: the filesystem backend writes to a temp file
//! and renames, so readers never observe a partial blob.

pub mod disk;
pub mod memory;

use async_trait::async_trait;

use crate::error::MemoryError;

/// Reserved artifact name holding the serialized pipeline state record.
pub const STATE_ARTIFACT: &str = "pipeline.state";

/// Key prefix covering every artifact of one document, trailing slash
/// included so sibling ids never alias (`doc1` vs `doc10`).
pub fn document_prefix(index: &str, document_id: &str) -> String {
    format!("{index}/{document_id}/")
}

/// Full artifact key for a named blob of a document.
pub fn artifact_key(index: &str, document_id: &str, name: &str) -> String {
    format!("{index}/{document_id}/{name}")
}

/// Artifact name for the n-th uploaded source file.
pub fn source_artifact_name(n: usize, ext: &str) -> String {
    format!("source.{n}.{ext}")
}

/// Artifact name for a step output: `{step}.{file_id}.{part}.{ext}`.
pub fn step_artifact_name(step: &str, file_id: &str, part: usize, ext: &str) -> String {
    format!("{step}.{file_id}.{part}.{ext}")
}

/// Abstract blob store for pipeline intermediates.
///
/// Implementations must tolerate concurrent readers and serialize writes
/// per key. All operations are async (via `async-trait`); the in-memory
/// backend returns immediately-ready futures.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Write a blob under a key, replacing any existing content.
    /// Atomic per key: readers see the old blob or the new one, never a
    /// partial write.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), MemoryError>;

    /// Read a blob. `NotFound` when the key is absent.
    async fn get(&self, key: &str) -> Result<Vec<u8>, MemoryError>;

    /// True when the key holds a blob.
    async fn exists(&self, key: &str) -> Result<bool, MemoryError> {
        match self.get(key).await {
            Ok(_) => Ok(true),
            Err(MemoryError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// All keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, MemoryError>;

    /// Remove every key starting with `prefix`. Recursive and
    /// idempotent: deleting an absent prefix succeeds.
    async fn delete_prefix(&self, prefix: &str) -> Result<(), MemoryError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        assert_eq!(artifact_key("idx", "doc", "pipeline.state"), "idx/doc/pipeline.state");
        assert_eq!(source_artifact_name(0, "txt"), "source.0.txt");
        assert_eq!(
            step_artifact_name("partition_text", "f0", 2, "txt"),
            "partition_text.f0.2.txt"
        );
        assert_eq!(document_prefix("idx", "doc"), "idx/doc/");
    }
}
