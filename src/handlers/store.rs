//! `save_records` — write the document's chunks into the retrieval index.

use std::collections::BTreeMap;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::MemoryError;
use crate::index::MemoryRecord;
use crate::models::{
    MemoryFilter, PipelineState, TAG_DOCUMENT_ID, TAG_FILE_ID, TAG_FILE_PART,
};

use super::embed::EmbeddingArtifact;
use super::{
    part_index_of, HandlerContext, StepHandler, StepOutcome, STEP_EMBED, STEP_PARTITION, STEP_SAVE,
};

/// Assembles one [`MemoryRecord`] per partition — text, vector, document
/// tags plus the automatic `__document_id` / `__file_id` / `__file_part`
/// tags — then replaces the document's records in the index.
///
/// Stale records from a previous ingestion of the same document id are
/// removed first via a `__document_id` filter, so a re-ingested document
/// never leaves orphan chunks behind. Record ids are deterministic
/// (`{document_id}/{file_id}/{part}`), which makes a re-run of this step
/// overwrite rather than duplicate.
pub struct SaveRecordsHandler;

#[async_trait]
impl StepHandler for SaveRecordsHandler {
    fn name(&self) -> &str {
        STEP_SAVE
    }

    async fn invoke(
        &self,
        ctx: &HandlerContext,
        state: &mut PipelineState,
    ) -> Result<StepOutcome, MemoryError> {
        let mut records = Vec::new();

        for file in &state.files {
            if ctx.cancel.is_cancelled() {
                return Ok(StepOutcome::RetryLater(Duration::ZERO));
            }

            let partitions: BTreeMap<usize, String> = file
                .generated_by(STEP_PARTITION)
                .filter_map(|g| part_index_of(&g.artifact_key).map(|p| (p, g.artifact_key.clone())))
                .collect();
            let embeddings: BTreeMap<usize, String> = file
                .generated_by(STEP_EMBED)
                .filter_map(|g| part_index_of(&g.artifact_key).map(|p| (p, g.artifact_key.clone())))
                .collect();

            for (part, text_key) in &partitions {
                let bytes = ctx.artifacts.get(text_key).await?;
                let text = String::from_utf8_lossy(&bytes).into_owned();

                // A plan without the embedding step indexes text-only records.
                let vector = match embeddings.get(part) {
                    Some(vec_key) => {
                        let bytes = ctx.artifacts.get(vec_key).await?;
                        let artifact: EmbeddingArtifact =
                            serde_json::from_slice(&bytes).map_err(|e| {
                                MemoryError::DataIntegrity(format!(
                                    "corrupt embedding artifact '{vec_key}': {e}"
                                ))
                            })?;
                        artifact.vector
                    }
                    None => Vec::new(),
                };

                let mut tags = state.tags.clone();
                tags.add(TAG_DOCUMENT_ID, state.document_id.clone());
                tags.add(TAG_FILE_ID, file.file_id.clone());
                tags.add(TAG_FILE_PART, part.to_string());

                records.push(MemoryRecord {
                    id: format!("{}/{}/{}", state.document_id, file.file_id, part),
                    index: state.index.clone(),
                    document_id: state.document_id.clone(),
                    file_id: file.file_id.clone(),
                    part_index: *part,
                    source_file: file.name.clone(),
                    text,
                    vector,
                    tags,
                });
            }
        }

        // Replace rather than accumulate: clear any records from a prior
        // ingestion of this document id, then write the fresh set.
        ctx.index
            .delete_by_filter(
                &state.index,
                &[MemoryFilter::by_document(&state.document_id)],
            )
            .await?;
        ctx.index.upsert(records).await?;

        Ok(StepOutcome::Advance)
    }
}
