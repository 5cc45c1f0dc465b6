//! Job submission.
//!
//! Submission enqueues real work on the engine, so it happens exactly
//! once per request and is never retried here.

use imagegen_comfyui::api::ComfyUIApiError;
use imagegen_comfyui::engine::Engine;
use imagegen_core::parameterize::ParameterizedGraph;

use crate::error::GenerationError;
use crate::job::{JobHandle, JobId};

/// Send `graph` to the engine and return a `Queued` handle.
pub async fn submit<E: Engine + ?Sized>(
    engine: &E,
    graph: &ParameterizedGraph,
    client_id: &str,
) -> Result<JobHandle, GenerationError> {
    let response = engine
        .submit(graph, client_id)
        .await
        .map_err(submission_error)?;

    if response.has_node_errors() {
        return Err(GenerationError::EngineRejected {
            message: format!("node errors: {}", response.node_errors),
        });
    }

    tracing::info!(
        job_id = %response.prompt_id,
        client_id = %client_id,
        queue_number = response.number,
        "Workflow submitted",
    );

    Ok(JobHandle::new(
        JobId::new(response.prompt_id),
        client_id,
        chrono::Utc::now(),
    ))
}

fn submission_error(err: ComfyUIApiError) -> GenerationError {
    match err {
        e if e.is_transport() => GenerationError::EngineUnreachable {
            message: e.to_string(),
        },
        ComfyUIApiError::ApiError { status, body } => GenerationError::EngineRejected {
            message: format!("HTTP {status}: {}", rejection_message(&body)),
        },
        other => GenerationError::EngineRejected {
            message: other.to_string(),
        },
    }
}

/// Pull the human-readable part out of a ComfyUI `/prompt` error body:
/// `{"error": {"message": ..., "details": ...}, "node_errors": {...}}`.
fn rejection_message(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return body.trim().to_string();
    };
    let error = &value["error"];
    let message = error["message"].as_str().unwrap_or_default();
    let details = error["details"].as_str().unwrap_or_default();

    let mut text = match (message.is_empty(), details.is_empty()) {
        (true, _) => body.trim().to_string(),
        (false, true) => message.to_string(),
        (false, false) => format!("{message}: {details}"),
    };
    if let Some(nodes) = value["node_errors"].as_object().filter(|n| !n.is_empty()) {
        let ids: Vec<&str> = nodes.keys().map(String::as_str).collect();
        text.push_str(&format!(" (nodes: {})", ids.join(", ")));
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use assert_matches::assert_matches;
    use imagegen_comfyui::engine::ComfyUIEngine;
    use imagegen_comfyui::testing::StubEngine;
    use imagegen_core::aspect_ratio::AspectRatioTable;
    use imagegen_core::manifest::BindingManifest;
    use imagegen_core::parameterize::parameterize;
    use imagegen_core::request::{AspectRatio, GenerationRequest};
    use imagegen_core::workflow::{NodeId, WorkflowTemplate};

    fn graph() -> ParameterizedGraph {
        let template = WorkflowTemplate::from_json_str(
            r#"{"9": {"class_type": "SaveImage", "inputs": {}}}"#,
        )
        .unwrap();
        let manifest = BindingManifest::new(
            NodeId::from("9"),
            Vec::new(),
            Vec::new(),
            Vec::new(),
            AspectRatioTable::default(),
        );
        let request = GenerationRequest::new("p", "t", AspectRatio::Square).unwrap();
        parameterize(&template, &manifest, &request, 1).unwrap()
    }

    #[tokio::test]
    async fn successful_submit_is_queued() {
        let engine = StubEngine::new("9", Vec::new());
        let handle = submit(&engine, &graph(), "client-1").await.unwrap();

        assert_eq!(handle.status(), JobStatus::Queued);
        assert_eq!(handle.job_id().as_str(), "stub-prompt-1");
        assert_eq!(handle.client_id(), "client-1");
        assert_eq!(engine.submissions().len(), 1);
    }

    #[tokio::test]
    async fn http_400_is_rejected() {
        let body = r#"{"error": {"type": "invalid_prompt", "message": "Cannot execute because a node is missing the class_type property.", "details": "Node ID '#7'"}, "node_errors": {}}"#;
        let engine = StubEngine::new("9", Vec::new()).rejecting(body);

        let err = submit(&engine, &graph(), "c").await.unwrap_err();
        assert_matches!(
            err,
            GenerationError::EngineRejected { ref message }
                if message.starts_with("HTTP 400: Cannot execute") && message.ends_with("Node ID '#7'")
        );
    }

    #[tokio::test]
    async fn unreachable_engine() {
        let engine = ComfyUIEngine::new("127.0.0.1", 9);
        let err = submit(&engine, &graph(), "c").await.unwrap_err();
        assert_matches!(err, GenerationError::EngineUnreachable { .. });
    }

    #[test]
    fn rejection_message_lists_failing_nodes() {
        let body = r#"{"error": {"message": "Prompt outputs failed validation"}, "node_errors": {"5": {}}}"#;
        assert_eq!(
            rejection_message(body),
            "Prompt outputs failed validation (nodes: 5)"
        );
    }

    #[test]
    fn rejection_message_falls_back_to_raw_body() {
        assert_eq!(rejection_message("  Internal Server Error "), "Internal Server Error");
    }
}
