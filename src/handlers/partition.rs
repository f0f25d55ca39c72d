//! `partition_text` — split extracted text into retrievable fragments.

use async_trait::async_trait;
use std::time::Duration;

use crate::artifacts::{artifact_key, step_artifact_name};
use crate::chunk::partition_text;
use crate::error::MemoryError;
use crate::extract::MIME_PLAIN;
use crate::models::{GeneratedFile, PipelineState};

use super::{HandlerContext, StepHandler, StepOutcome, STEP_EXTRACT, STEP_PARTITION};

/// Splits each file's extracted text on paragraph boundaries and writes
/// one `partition_text.{file_id}.{part}.txt` artifact per fragment.
///
/// When the extraction step was not part of the plan, textual source
/// bytes are partitioned directly.
pub struct TextPartitioningHandler;

#[async_trait]
impl StepHandler for TextPartitioningHandler {
    fn name(&self) -> &str {
        STEP_PARTITION
    }

    async fn invoke(
        &self,
        ctx: &HandlerContext,
        state: &mut PipelineState,
    ) -> Result<StepOutcome, MemoryError> {
        let max_tokens = ctx.config.partitioning.max_tokens;
        let file_ids: Vec<String> = state.files.iter().map(|f| f.file_id.clone()).collect();

        for file_id in file_ids {
            if ctx.cancel.is_cancelled() {
                return Ok(StepOutcome::RetryLater(Duration::ZERO));
            }

            let text_key = {
                let file = state.file(&file_id).ok_or_else(|| {
                    MemoryError::DataIntegrity(format!("state lost file '{file_id}'"))
                })?;
                file.generated_by(STEP_EXTRACT)
                    .next()
                    .map(|g| g.artifact_key.clone())
                    .unwrap_or_else(|| file.artifact_key.clone())
            };

            let bytes = ctx.artifacts.get(&text_key).await?;
            let text = String::from_utf8_lossy(&bytes);
            let partitions = partition_text(&text, max_tokens);

            for partition in &partitions {
                let name =
                    step_artifact_name(STEP_PARTITION, &file_id, partition.part_index, "txt");
                let key = artifact_key(&state.index, &state.document_id, &name);
                ctx.artifacts.put(&key, partition.text.as_bytes()).await?;

                if let Some(file) = state.file_mut(&file_id) {
                    file.add_generated(GeneratedFile {
                        step: STEP_PARTITION.to_string(),
                        artifact_key: key,
                        content_type: MIME_PLAIN.to_string(),
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
    use crate::embedding::DisabledProvider;
    use crate::index::memory::InMemoryIndex;
    use crate::models::{FileRef, TagCollection};

    fn context(artifacts: Arc<MemoryArtifactStore>) -> HandlerContext {
        HandlerContext {
            artifacts,
            index: Arc::new(InMemoryIndex::new()),
            embedder: Arc::new(DisabledProvider),
            config: Arc::new(Config::default()),
            cancel: CancelToken::never(),
        }
    }

    #[tokio::test]
    async fn partitions_extracted_text() {
        let artifacts = Arc::new(MemoryArtifactStore::new());
        artifacts
            .put("idx/doc/extract_text.f0.0.txt", b"Alpha.\n\nBeta.")
            .await
            .unwrap();

        let mut state = PipelineState::new(
            "idx",
            "doc",
            TagCollection::new(),
            vec![STEP_PARTITION.to_string()],
        );
        state.files.push(FileRef {
            file_id: "f0".into(),
            name: "a.txt".into(),
            artifact_key: "idx/doc/source.0.txt".into(),
            content_type: "text/plain".into(),
            size: 13,
            generated: vec![GeneratedFile {
                step: STEP_EXTRACT.to_string(),
                artifact_key: "idx/doc/extract_text.f0.0.txt".into(),
                content_type: MIME_PLAIN.to_string(),
                parent_file_id: "f0".into(),
            }],
        });

        let ctx = context(artifacts.clone());
        let outcome = TextPartitioningHandler
            .invoke(&ctx, &mut state)
            .await
            .unwrap();
        assert_eq!(outcome, StepOutcome::Advance);

        let parts: Vec<_> = state.files[0].generated_by(STEP_PARTITION).collect();
        assert_eq!(parts.len(), 1);
        let stored = artifacts.get(&parts[0].artifact_key).await.unwrap();
        assert!(String::from_utf8_lossy(&stored).contains("Alpha."));
    }

    #[tokio::test]
    async fn falls_back_to_source_without_extraction() {
        let artifacts = Arc::new(MemoryArtifactStore::new());
        artifacts
            .put("idx/doc/source.0.txt", b"Direct text.")
            .await
            .unwrap();

        let mut state = PipelineState::new(
            "idx",
            "doc",
            TagCollection::new(),
            vec![STEP_PARTITION.to_string()],
        );
        state.files.push(FileRef {
            file_id: "f0".into(),
            name: "a.txt".into(),
            artifact_key: "idx/doc/source.0.txt".into(),
            content_type: "text/plain".into(),
            size: 12,
            generated: Vec::new(),
        });

        let ctx = context(artifacts.clone());
        TextPartitioningHandler
            .invoke(&ctx, &mut state)
            .await
            .unwrap();
        assert_eq!(state.files[0].generated_by(STEP_PARTITION).count(), 1);
    }
}
