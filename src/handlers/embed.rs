//! `generate_embeddings` — embed every text partition.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::artifacts::{artifact_key, step_artifact_name};
use crate::error::MemoryError;
use crate::extract::MIME_JSON;
use crate::models::{GeneratedFile, PipelineState};

use super::{part_index_of, HandlerContext, StepHandler, StepOutcome, STEP_EMBED, STEP_PARTITION};

/// Self-describing embedding artifact, one per partition, stored as
/// `generate_embeddings.{file_id}.{part}.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingArtifact {
    pub model: String,
    pub dims: usize,
    pub vector: Vec<f32>,
}

/// Reads each file's partitions, embeds them in one provider batch per
/// file, and writes one [`EmbeddingArtifact`] per partition.
///
/// Transient provider failures propagate to the orchestrator, which
/// re-delivers the message with backoff; the deterministic artifact keys
/// make the re-run overwrite cleanly.
pub struct EmbeddingGenerationHandler;

#[async_trait]
impl StepHandler for EmbeddingGenerationHandler {
    fn name(&self) -> &str {
        STEP_EMBED
    }

    async fn invoke(
        &self,
        ctx: &HandlerContext,
        state: &mut PipelineState,
    ) -> Result<StepOutcome, MemoryError> {
        let file_ids: Vec<String> = state.files.iter().map(|f| f.file_id.clone()).collect();

        for file_id in file_ids {
            if ctx.cancel.is_cancelled() {
                return Ok(StepOutcome::RetryLater(Duration::ZERO));
            }

            let partition_keys: Vec<(usize, String)> = {
                let file = state.file(&file_id).ok_or_else(|| {
                    MemoryError::DataIntegrity(format!("state lost file '{file_id}'"))
                })?;
                let mut keys: Vec<(usize, String)> = file
                    .generated_by(STEP_PARTITION)
                    .filter_map(|g| {
                        part_index_of(&g.artifact_key).map(|p| (p, g.artifact_key.clone()))
                    })
                    .collect();
                keys.sort();
                keys
            };
            if partition_keys.is_empty() {
                continue;
            }

            let mut texts = Vec::with_capacity(partition_keys.len());
            for (_, key) in &partition_keys {
                let bytes = ctx.artifacts.get(key).await?;
                texts.push(String::from_utf8_lossy(&bytes).into_owned());
            }

            let vectors = ctx.embedder.embed(&texts).await?;
            if vectors.len() != texts.len() {
                return Err(MemoryError::transient(format!(
                    "embedder returned {} vectors for {} partitions",
                    vectors.len(),
                    texts.len()
                )));
            }

            for ((part, _), vector) in partition_keys.iter().zip(vectors) {
                let artifact = EmbeddingArtifact {
                    model: ctx.embedder.model_name().to_string(),
                    dims: vector.len(),
                    vector,
                };
                let bytes = serde_json::to_vec(&artifact)
                    .map_err(|e| MemoryError::transient(format!("encode embedding: {e}")))?;

                let name = step_artifact_name(STEP_EMBED, &file_id, *part, "json");
                let key = artifact_key(&state.index, &state.document_id, &name);
                ctx.artifacts.put(&key, &bytes).await?;

                if let Some(file) = state.file_mut(&file_id) {
                    file.add_generated(GeneratedFile {
                        step: STEP_EMBED.to_string(),
                        artifact_key: key,
                        content_type: MIME_JSON.to_string(),
                        parent_file_id: file_id.clone(),
                    });
                }
            }
        }

        Ok(StepOutcome::Advance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::artifacts::memory::MemoryArtifactStore;
    use crate::artifacts::ArtifactStore;
    use crate::cancel::CancelToken;
    use crate::config::Config;
    use crate::embedding::EmbeddingProvider;
    use crate::index::memory::InMemoryIndex;
    use crate::models::{FileRef, TagCollection};

    struct UnitEmbedder;

    #[async_trait]
    impl EmbeddingProvider for UnitEmbedder {
        fn model_name(&self) -> &str {
            "unit-test"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, MemoryError> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    #[tokio::test]
    async fn writes_one_embedding_per_partition() {
        let artifacts = Arc::new(MemoryArtifactStore::new());
        artifacts
            .put("idx/doc/partition_text.f0.0.txt", b"Alpha.")
            .await
            .unwrap();
        artifacts
            .put("idx/doc/partition_text.f0.1.txt", b"Beta.")
            .await
            .unwrap();

        let mut state = PipelineState::new(
            "idx",
            "doc",
            TagCollection::new(),
            vec![STEP_EMBED.to_string()],
        );
        let mut file = FileRef {
            file_id: "f0".into(),
            name: "a.txt".into(),
            artifact_key: "idx/doc/source.0.txt".into(),
            content_type: "text/plain".into(),
            size: 0,
            generated: Vec::new(),
        };
        for part in 0..2 {
            file.add_generated(GeneratedFile {
                step: STEP_PARTITION.to_string(),
                artifact_key: format!("idx/doc/partition_text.f0.{part}.txt"),
                content_type: "text/plain".into(),
                parent_file_id: "f0".into(),
            });
        }
        state.files.push(file);

        let ctx = HandlerContext {
            artifacts: artifacts.clone(),
            index: Arc::new(InMemoryIndex::new()),
            embedder: Arc::new(UnitEmbedder),
            config: Arc::new(Config::default()),
            cancel: CancelToken::never(),
        };

        let outcome = EmbeddingGenerationHandler
            .invoke(&ctx, &mut state)
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Advance);

        let embeddings: Vec<_> = state.files[0].generated_by(STEP_EMBED).collect();
        assert_eq!(embeddings.len(), 2);

        let bytes = artifacts
            .get("idx/doc/generate_embeddings.f0.1.json")
            .await
            .unwrap();
        let artifact: EmbeddingArtifact = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(artifact.model, "unit-test");
        assert_eq!(artifact.vector, vec![1.0, 0.0]);
    }
}
