//! In-memory [`ArtifactStore`] for tests and single-process use.
//!
//! Uses a `BTreeMap` behind `std::sync::RwLock`; prefix listing is an
//! ordered scan, so keys come back sorted for free.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::MemoryError;

use super::ArtifactStore;

#[derive(Default)]
pub struct MemoryArtifactStore {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), MemoryError> {
        let mut blobs = self
            .blobs
            .write()
            .map_err(|_| MemoryError::transient("artifact store lock poisoned"))?;
        blobs.insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, MemoryError> {
        let blobs = self
            .blobs
            .read()
            .map_err(|_| MemoryError::transient("artifact store lock poisoned"))?;
        blobs
            .get(key)
            .cloned()
            .ok_or_else(|| MemoryError::not_found(format!("artifact '{key}'")))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, MemoryError> {
        let blobs = self
            .blobs
            .read()
            .map_err(|_| MemoryError::transient("artifact store lock poisoned"))?;
        Ok(blobs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), MemoryError> {
        let mut blobs = self
            .blobs
            .write()
            .map_err(|_| MemoryError::transient("artifact store lock poisoned"))?;
        blobs.retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_roundtrip() {
        let store = MemoryArtifactStore::new();
        store.put("idx/doc/source.0.txt", b"hello").await.unwrap();
        assert_eq!(store.get("idx/doc/source.0.txt").await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn get_missing_is_not_found() {
        let store = MemoryArtifactStore::new();
        assert!(matches!(
            store.get("idx/doc/missing").await,
            Err(MemoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_respects_prefix_and_sorts() {
        let store = MemoryArtifactStore::new();
        store.put("idx/b/x", b"1").await.unwrap();
        store.put("idx/a/y", b"2").await.unwrap();
        store.put("idx/a/x", b"3").await.unwrap();
        store.put("other/a/x", b"4").await.unwrap();

        let keys = store.list("idx/a/").await.unwrap();
        assert_eq!(keys, vec!["idx/a/x", "idx/a/y"]);
    }

    #[tokio::test]
    async fn delete_prefix_is_recursive_and_idempotent() {
        let store = MemoryArtifactStore::new();
        store.put("idx/doc/a", b"1").await.unwrap();
        store.put("idx/doc/b", b"2").await.unwrap();
        store.put("idx/other/a", b"3").await.unwrap();

        store.delete_prefix("idx/doc/").await.unwrap();
        assert!(store.list("idx/doc/").await.unwrap().is_empty());
        assert_eq!(store.list("idx/").await.unwrap().len(), 1);

        // deleting again is a no-op
        store.delete_prefix("idx/doc/").await.unwrap();
    }

    #[tokio::test]
    async fn put_overwrites_in_place() {
        let store = MemoryArtifactStore::new();
        store.put("k", b"old").await.unwrap();
        store.put("k", b"new").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), b"new");
    }
}
