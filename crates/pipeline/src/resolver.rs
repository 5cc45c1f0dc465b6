//! Result resolution: from a completed job to the save node's bytes.
//!
//! ComfyUI announces `execution_success` before it writes the prompt's
//! history, so a job completed over the WebSocket may briefly have no
//! history entry. The lookup is repeated a few times before the output
//! counts as missing.

use std::time::Duration;

use imagegen_comfyui::engine::Engine;
use imagegen_comfyui::history::ImageRef;
use imagegen_core::workflow::NodeId;

use crate::clock::Clock;
use crate::error::GenerationError;
use crate::job::{JobHandle, JobId, JobStatus};

/// History lookups for a completed job before its output counts as missing.
const HISTORY_ATTEMPTS: u32 = 3;
const HISTORY_RECHECK_DELAY: Duration = Duration::from_millis(250);

/// The image a job produced on its save node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    pub origin_node: NodeId,
    /// Filename the engine stored the image under.
    pub source_name: String,
}

/// Locate and download the output of `save_node` for a completed job.
///
/// Uses the images recorded on the handle while tracking when present,
/// otherwise reads the job's history. When the save node produced
/// several images the first one is returned.
pub async fn resolve<E: Engine + ?Sized>(
    engine: &E,
    handle: &JobHandle,
    save_node: &NodeId,
    clock: &dyn Clock,
) -> Result<Artifact, GenerationError> {
    let job_id = handle.job_id();
    if handle.status() != JobStatus::Completed {
        return Err(GenerationError::NotCompleted {
            job_id: job_id.clone(),
            status: handle.status(),
        });
    }

    let image = match handle.outputs().first() {
        Some(image) => image.clone(),
        None => saved_image(engine, job_id, save_node, clock)
            .await?
            .ok_or_else(|| GenerationError::ArtifactMissing {
                job_id: job_id.clone(),
                node_id: save_node.clone(),
            })?,
    };

    let fetched = engine
        .fetch_image(&image)
        .await
        .map_err(|e| GenerationError::RetrievalFailed {
            job_id: job_id.clone(),
            message: e.to_string(),
        })?;
    if fetched.bytes.is_empty() {
        return Err(GenerationError::RetrievalFailed {
            job_id: job_id.clone(),
            message: format!("'{}' was empty", image.filename),
        });
    }

    tracing::debug!(
        job_id = %job_id,
        node_id = %save_node,
        file = %image.filename,
        bytes = fetched.bytes.len(),
        "Fetched job output",
    );

    Ok(Artifact {
        bytes: fetched.bytes,
        content_type: fetched.content_type,
        origin_node: save_node.clone(),
        source_name: image.filename,
    })
}

/// First image of `save_node` in the job's history, re-reading history
/// while it is absent or has no output for the node yet.
async fn saved_image<E: Engine + ?Sized>(
    engine: &E,
    job_id: &JobId,
    save_node: &NodeId,
    clock: &dyn Clock,
) -> Result<Option<ImageRef>, GenerationError> {
    for attempt in 1..=HISTORY_ATTEMPTS {
        let entry = engine
            .history(job_id.as_str())
            .await
            .map_err(|e| GenerationError::RetrievalFailed {
                job_id: job_id.clone(),
                message: e.to_string(),
            })?;
        let image = entry.and_then(|entry| entry.images_for(save_node.as_str()).first().cloned());
        if image.is_some() {
            return Ok(image);
        }
        if attempt < HISTORY_ATTEMPTS {
            tracing::debug!(job_id = %job_id, attempt, "Save node output not in history yet");
            clock.sleep(HISTORY_RECHECK_DELAY).await;
        }
    }
    Ok(None)
}
