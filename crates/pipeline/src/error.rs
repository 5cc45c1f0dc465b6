use std::path::PathBuf;
use std::time::Duration;

use imagegen_core::error::CoreError;
use imagegen_core::workflow::NodeId;

use crate::job::{JobId, JobStatus};
use crate::status::EngineFailure;

/// Per-request failures of the generation pipeline.
///
/// None of these are retried by the pipeline. `TimedOut` is kept apart
/// from `Failed` because the engine may still finish the job.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("ComfyUI is unreachable: {message}")]
    EngineUnreachable { message: String },

    #[error("ComfyUI rejected the workflow: {message}")]
    EngineRejected { message: String },

    #[error("Job {job_id} timed out after {}s; it may still complete on the engine", waited.as_secs())]
    TimedOut { job_id: JobId, waited: Duration },

    #[error("Job {job_id} failed: {failure}")]
    Failed {
        job_id: JobId,
        failure: EngineFailure,
    },

    #[error("Job {job_id} completed but save node '{node_id}' produced no image")]
    ArtifactMissing { job_id: JobId, node_id: NodeId },

    #[error("Failed to retrieve the output of job {job_id}: {message}")]
    RetrievalFailed { job_id: JobId, message: String },

    #[error("Failed to write {}: {source}", path.display())]
    PersistenceFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Job {job_id} was abandoned before it finished")]
    Cancelled { job_id: JobId },

    #[error("Job {job_id} is {status}, not completed")]
    NotCompleted { job_id: JobId, status: JobStatus },
}

impl GenerationError {
    /// Stable snake_case code for the failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            GenerationError::Core(e) => match e {
                CoreError::UnknownAspectRatio { .. } => "unknown_aspect_ratio",
                CoreError::InvalidBinding { .. } => "invalid_binding",
                CoreError::MalformedWorkflow(_) => "malformed_workflow",
                CoreError::MalformedManifest(_) => "malformed_manifest",
                CoreError::InvalidRequest(_) => "invalid_request",
                CoreError::Io { .. } => "io",
            },
            GenerationError::EngineUnreachable { .. } => "engine_unreachable",
            GenerationError::EngineRejected { .. } => "engine_rejected",
            GenerationError::TimedOut { .. } => "timed_out",
            GenerationError::Failed { .. } => "failed",
            GenerationError::ArtifactMissing { .. } => "artifact_missing",
            GenerationError::RetrievalFailed { .. } => "retrieval_failed",
            GenerationError::PersistenceFailed { .. } => "persistence_failed",
            GenerationError::Cancelled { .. } => "cancelled",
            GenerationError::NotCompleted { .. } => "not_completed",
        }
    }

    /// The job this error is about, when one had been submitted.
    pub fn job_id(&self) -> Option<&JobId> {
        match self {
            GenerationError::TimedOut { job_id, .. }
            | GenerationError::Failed { job_id, .. }
            | GenerationError::ArtifactMissing { job_id, .. }
            | GenerationError::RetrievalFailed { job_id, .. }
            | GenerationError::Cancelled { job_id }
            | GenerationError::NotCompleted { job_id, .. } => Some(job_id),
            _ => None,
        }
    }
}
