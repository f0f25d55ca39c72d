//! `extract_text` — turn every source file into plain UTF-8 text.

use async_trait::async_trait;
use std::time::Duration;

use crate::artifacts::{artifact_key, step_artifact_name};
use crate::error::MemoryError;
use crate::extract::{extract_text, MIME_PLAIN};
use crate::models::{GeneratedFile, PipelineState};

use super::{HandlerContext, StepHandler, StepOutcome, STEP_EXTRACT};

/// Reads each source artifact, extracts plain text per its MIME type,
/// and records one `extract_text.{file_id}.0.txt` descendant per file.
pub struct TextExtractionHandler;

#[async_trait]
impl StepHandler for TextExtractionHandler {
    fn name(&self) -> &str {
        STEP_EXTRACT
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

            let (source_key, content_type) = {
                let file = state.file(&file_id).ok_or_else(|| {
                    MemoryError::DataIntegrity(format!("state lost file '{file_id}'"))
                })?;
                (file.artifact_key.clone(), file.content_type.clone())
            };

            let bytes = ctx.artifacts.get(&source_key).await?;
            let text = match extract_text(&bytes, &content_type) {
                Ok(text) => text,
                Err(MemoryError::Permanent(msg)) => return Ok(StepOutcome::Fatal(msg)),
                Err(e) => return Err(e),
            };

            let name = step_artifact_name(STEP_EXTRACT, &file_id, 0, "txt");
            let key = artifact_key(&state.index, &state.document_id, &name);
            ctx.artifacts.put(&key, text.as_bytes()).await?;

            if let Some(file) = state.file_mut(&file_id) {
                file.add_generated(GeneratedFile {
                    step: STEP_EXTRACT.to_string(),
                    artifact_key: key,
                    content_type: MIME_PLAIN.to_string(),
                    parent_file_id: file_id.clone(),
                });
            }
        }

        Ok(StepOutcome::Advance)
    }
}
