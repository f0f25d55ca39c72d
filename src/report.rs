//! Read-only status projection of pipeline state.
//!
//! External callers never see the raw [`PipelineState`]; they get this
//! projection, which also computes the `ready` flag: true iff the
//! document completed every step of its plan without failure.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::{FailureReason, PipelineState, PipelineStatus};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentStatus {
    pub index: String,
    pub document_id: String,
    pub status: PipelineStatus,
    /// True iff `status == complete` and no steps remain.
    pub ready: bool,
    pub completed_steps: Vec<String>,
    pub remaining_steps: Vec<String>,
    /// Completion time per executed step.
    pub step_timestamps: BTreeMap<String, DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    /// Highest queue delivery attempt observed.
    pub attempt_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<FailureReason>,
}

pub fn project(state: &PipelineState) -> DocumentStatus {
    DocumentStatus {
        index: state.index.clone(),
        document_id: state.document_id.clone(),
        status: state.status,
        ready: state.status == PipelineStatus::Complete && state.steps_to_execute.is_empty(),
        completed_steps: state.steps_completed.clone(),
        remaining_steps: state.steps_to_execute.clone(),
        step_timestamps: state.step_timestamps.clone(),
        created_at: state.creation_time,
        last_update: state.last_update_time,
        attempt_count: state.attempt_count,
        failure_reason: state.failure_reason.clone(),
    }
}
