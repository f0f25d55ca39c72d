//! Filesystem [`ArtifactStore`] for durable single-node deployments.
//!
//! Keys map directly onto paths under the configured root; the `/`
//! separators in a key become directories. Writes go to a temp sibling
//! and are renamed into place, so a crash mid-write never leaves a
//! half-written artifact behind.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::error::MemoryError;

use super::ArtifactStore;

pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, MemoryError> {
        let root = root.into();
        fs::create_dir_all(&root)
            .map_err(|e| MemoryError::transient(format!("create artifact root: {e}")))?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, MemoryError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }
}

/// Keys are relative, slash-separated, and must not escape the root.
fn validate_key(key: &str) -> Result<(), MemoryError> {
    if key.is_empty() {
        return Err(MemoryError::validation("artifact key must not be empty"));
    }
    for segment in key.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(MemoryError::validation(format!(
                "invalid artifact key '{key}'"
            )));
        }
    }
    Ok(())
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut key = String::new();
    for component in rel.components() {
        if !key.is_empty() {
            key.push('/');
        }
        key.push_str(&component.as_os_str().to_string_lossy());
    }
    Some(key)
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<(), MemoryError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| MemoryError::transient(format!("create artifact dir: {e}")))?;
        }

        // Atomic write: temp sibling, then rename into place.
        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
        fs::write(&tmp, bytes)
            .map_err(|e| MemoryError::transient(format!("write artifact '{key}': {e}")))?;
        fs::rename(&tmp, &path)
            .map_err(|e| MemoryError::transient(format!("commit artifact '{key}': {e}")))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, MemoryError> {
        let path = self.path_for(key)?;
        match fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(MemoryError::not_found(format!("artifact '{key}'")))
            }
            Err(e) => Err(MemoryError::transient(format!(
                "read artifact '{key}': {e}"
            ))),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, MemoryError> {
        let mut keys = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    if e.io_error()
                        .map(|io| io.kind() == std::io::ErrorKind::NotFound)
                        .unwrap_or(false)
                    {
                        continue;
                    }
                    return Err(MemoryError::transient(format!("list artifacts: {e}")));
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            if let Some(key) = relative_key(&self.root, entry.path()) {
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<(), MemoryError> {
        for key in self.list(prefix).await? {
            let path = self.root.join(&key);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(MemoryError::transient(format!(
                        "delete artifact '{key}': {e}"
                    )))
                }
            }
            // Best-effort cleanup of now-empty directories.
            let mut parent = path.parent();
            while let Some(dir) = parent {
                if dir == self.root || fs::remove_dir(dir).is_err() {
                    break;
                }
                parent = dir.parent();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn roundtrip_and_overwrite() {
        let tmp = TempDir::new().unwrap();
        let store = FsArtifactStore::new(tmp.path()).unwrap();

        store.put("idx/doc/source.0.txt", b"v1").await.unwrap();
        store.put("idx/doc/source.0.txt", b"v2").await.unwrap();
        assert_eq!(store.get("idx/doc/source.0.txt").await.unwrap(), b"v2");
    }

    #[tokio::test]
    async fn missing_key_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = FsArtifactStore::new(tmp.path()).unwrap();
        assert!(matches!(
            store.get("idx/doc/none").await,
            Err(MemoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_and_delete_prefix() {
        let tmp = TempDir::new().unwrap();
        let store = FsArtifactStore::new(tmp.path()).unwrap();

        store.put("idx/d1/a.txt", b"1").await.unwrap();
        store.put("idx/d1/b.txt", b"2").await.unwrap();
        store.put("idx/d2/a.txt", b"3").await.unwrap();

        let keys = store.list("idx/d1/").await.unwrap();
        assert_eq!(keys, vec!["idx/d1/a.txt", "idx/d1/b.txt"]);

        store.delete_prefix("idx/d1/").await.unwrap();
        assert!(store.list("idx/d1/").await.unwrap().is_empty());
        assert_eq!(store.list("idx/").await.unwrap(), vec!["idx/d2/a.txt"]);

        // idempotent
        store.delete_prefix("idx/d1/").await.unwrap();
    }

    #[tokio::test]
    async fn rejects_traversal_keys() {
        let tmp = TempDir::new().unwrap();
        let store = FsArtifactStore::new(tmp.path()).unwrap();
        assert!(store.put("../escape", b"x").await.is_err());
        assert!(store.get("a//b").await.is_err());
    }
}
