//! Status sources: where the tracker's observations come from.
//!
//! [`HistoryPoller`] asks `/history` and `/queue` once per call.
//! [`EventListener`] waits for the next relevant WebSocket message and
//! degrades to polling when the socket goes away.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use imagegen_comfyui::api::ComfyUIApiError;
use imagegen_comfyui::engine::Engine;
use imagegen_comfyui::history::{
    ExecutionFailure, HistoryOutcome, ImageRef, NodeOutput, QueuePosition,
};
use imagegen_comfyui::messages::ComfyUIMessage;
use imagegen_comfyui::stream::MessageStream;
use imagegen_core::workflow::NodeId;
use serde::Serialize;

use crate::job::JobId;

/// The engine's error payload for a failed job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineFailure {
    pub node_id: Option<String>,
    pub message: String,
}

impl fmt::Display for EngineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.node_id {
            Some(node) => write!(f, "node {node}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl From<ExecutionFailure> for EngineFailure {
    fn from(f: ExecutionFailure) -> Self {
        Self {
            node_id: f.node_id,
            message: f.message,
        }
    }
}

/// One reading of a job's state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// Nothing known yet (not in history, not visible in the queue).
    Pending,
    Queued,
    Running,
    /// Finished. `outputs` holds the save node's images when the source
    /// saw them, otherwise it is empty.
    Completed { outputs: Vec<ImageRef> },
    Failed(EngineFailure),
}

#[async_trait]
pub trait StatusSource: Send {
    /// Take one observation of `job_id`.
    async fn observe(&mut self, job_id: &JobId) -> Result<Observation, ComfyUIApiError>;

    /// Push sources block inside `observe` until something happens, so
    /// the tracker does not sleep between calls.
    fn is_push(&self) -> bool {
        false
    }
}

// ---------------------------------------------------------------------------
// Polling
// ---------------------------------------------------------------------------

/// Reads `/history/{id}`, then `/queue` while the job is not in history.
pub struct HistoryPoller<E: ?Sized> {
    engine: Arc<E>,
}

impl<E: Engine + ?Sized> HistoryPoller<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl<E: Engine + ?Sized> StatusSource for HistoryPoller<E> {
    async fn observe(&mut self, job_id: &JobId) -> Result<Observation, ComfyUIApiError> {
        if let Some(entry) = self.engine.history(job_id.as_str()).await? {
            return Ok(match entry.outcome() {
                HistoryOutcome::Succeeded => Observation::Completed {
                    outputs: Vec::new(),
                },
                HistoryOutcome::Failed(failure) => Observation::Failed(failure.into()),
                HistoryOutcome::InProgress => Observation::Running,
            });
        }

        Ok(match self.engine.queue().await?.position(job_id.as_str()) {
            QueuePosition::Running => Observation::Running,
            QueuePosition::Pending(_) => Observation::Queued,
            QueuePosition::Absent => Observation::Pending,
        })
    }
}

// ---------------------------------------------------------------------------
// Push
// ---------------------------------------------------------------------------

/// Follows ComfyUI WebSocket messages for one job.
///
/// Built without a stream (or after the stream ends) it behaves exactly
/// like its inner [`HistoryPoller`].
pub struct EventListener<E: ?Sized> {
    stream: Option<MessageStream>,
    poller: HistoryPoller<E>,
    save_node: NodeId,
}

impl<E: Engine + ?Sized> EventListener<E> {
    pub fn new(poller: HistoryPoller<E>, stream: Option<MessageStream>, save_node: NodeId) -> Self {
        Self {
            stream,
            poller,
            save_node,
        }
    }
}

#[async_trait]
impl<E: Engine + ?Sized> StatusSource for EventListener<E> {
    async fn observe(&mut self, job_id: &JobId) -> Result<Observation, ComfyUIApiError> {
        if let Some(stream) = self.stream.as_mut() {
            while let Some(message) = stream.next().await {
                if let Some(observation) = classify_message(&message, job_id, &self.save_node) {
                    return Ok(observation);
                }
            }
            tracing::warn!(job_id = %job_id, "ComfyUI WebSocket ended, falling back to polling");
            self.stream = None;
        }
        self.poller.observe(job_id).await
    }

    fn is_push(&self) -> bool {
        self.stream.is_some()
    }
}

/// Map a WebSocket message to an observation of `job_id`.
///
/// Returns `None` for messages about other prompts and for messages that
/// carry no status information.
pub fn classify_message(
    message: &ComfyUIMessage,
    job_id: &JobId,
    save_node: &NodeId,
) -> Option<Observation> {
    if message.prompt_id() != Some(job_id.as_str()) {
        return None;
    }

    match message {
        ComfyUIMessage::Status(_) => None,
        ComfyUIMessage::ExecutionStart(_)
        | ComfyUIMessage::ExecutionCached(_)
        | ComfyUIMessage::Progress(_) => Some(Observation::Running),
        ComfyUIMessage::Executing(data) => match data.node {
            Some(_) => Some(Observation::Running),
            None => Some(Observation::Completed {
                outputs: Vec::new(),
            }),
        },
        ComfyUIMessage::Executed(data) if data.node == save_node.as_str() => {
            let outputs = serde_json::from_value::<NodeOutput>(data.output.clone())
                .map(|out| out.images)
                .unwrap_or_default();
            Some(Observation::Completed { outputs })
        }
        ComfyUIMessage::Executed(_) => Some(Observation::Running),
        ComfyUIMessage::ExecutionSuccess(_) => Some(Observation::Completed {
            outputs: Vec::new(),
        }),
        ComfyUIMessage::ExecutionError(data) => Some(Observation::Failed(EngineFailure {
            node_id: Some(data.node_id.clone()),
            message: format!(
                "{}: {}",
                data.exception_type,
                data.exception_message.trim()
            ),
        })),
        ComfyUIMessage::ExecutionInterrupted(data) => Some(Observation::Failed(EngineFailure {
            node_id: data.node_id.clone(),
            message: "execution interrupted".to_string(),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use imagegen_comfyui::messages::parse_message;
    use imagegen_comfyui::testing::{stub_prompt_id, StubEngine};

    fn msg(json: &str) -> ComfyUIMessage {
        parse_message(json).unwrap()
    }

    fn classify(json: &str) -> Option<Observation> {
        classify_message(&msg(json), &JobId::new("p1"), &NodeId::from("9"))
    }

    #[test]
    fn other_prompts_ignored() {
        assert_eq!(
            classify(r#"{"type":"execution_start","data":{"prompt_id":"other"}}"#),
            None
        );
        assert_eq!(
            classify(r#"{"type":"status","data":{"status":{"exec_info":{"queue_remaining":1}}}}"#),
            None
        );
    }

    #[test]
    fn start_and_progress_are_running() {
        assert_eq!(
            classify(r#"{"type":"execution_start","data":{"prompt_id":"p1"}}"#),
            Some(Observation::Running)
        );
        assert_eq!(
            classify(r#"{"type":"executing","data":{"node":"3","prompt_id":"p1"}}"#),
            Some(Observation::Running)
        );
    }

    #[test]
    fn save_node_executed_completes_with_outputs() {
        let obs = classify(
            r#"{"type":"executed","data":{"node":"9","prompt_id":"p1","output":{"images":[{"filename":"a.png","subfolder":"","type":"output"}]}}}"#,
        );
        assert_matches!(obs, Some(Observation::Completed { ref outputs }) if outputs[0].filename == "a.png");
    }

    #[test]
    fn other_node_executed_is_running() {
        assert_eq!(
            classify(r#"{"type":"executed","data":{"node":"4","prompt_id":"p1","output":{}}}"#),
            Some(Observation::Running)
        );
    }

    #[test]
    fn done_signals_complete() {
        assert_eq!(
            classify(r#"{"type":"executing","data":{"node":null,"prompt_id":"p1"}}"#),
            Some(Observation::Completed { outputs: vec![] })
        );
        assert_eq!(
            classify(r#"{"type":"execution_success","data":{"prompt_id":"p1"}}"#),
            Some(Observation::Completed { outputs: vec![] })
        );
    }

    #[test]
    fn error_carries_engine_payload() {
        let obs = classify(
            r#"{"type":"execution_error","data":{"prompt_id":"p1","node_id":"30","exception_message":"OOM\n","exception_type":"RuntimeError"}}"#,
        );
        assert_eq!(
            obs,
            Some(Observation::Failed(EngineFailure {
                node_id: Some("30".into()),
                message: "RuntimeError: OOM".into(),
            }))
        );
    }

    #[tokio::test]
    async fn poller_reports_pending_then_completed() {
        let engine = Arc::new(StubEngine::new("9", b"x".to_vec()).pending_for(1));
        let mut poller = HistoryPoller::new(Arc::clone(&engine));
        let job = JobId::new(stub_prompt_id(1));

        // Nothing submitted yet: not in history, not in the queue.
        assert_eq!(poller.observe(&job).await.unwrap(), Observation::Pending);
        assert_matches!(
            poller.observe(&job).await.unwrap(),
            Observation::Completed { .. }
        );
    }

    #[tokio::test]
    async fn poller_reports_engine_failure() {
        let engine = Arc::new(StubEngine::new("9", Vec::new()).failing("boom"));
        let mut poller = HistoryPoller::new(engine);
        assert_matches!(
            poller.observe(&JobId::new("p")).await.unwrap(),
            Observation::Failed(EngineFailure { ref message, .. }) if message == "boom"
        );
    }

    #[tokio::test]
    async fn listener_uses_stream_then_falls_back() {
        let engine = Arc::new(StubEngine::new("9", Vec::new()));
        let stream = futures::stream::iter(vec![
            msg(r#"{"type":"execution_start","data":{"prompt_id":"other"}}"#),
            msg(r#"{"type":"execution_start","data":{"prompt_id":"p1"}}"#),
        ])
        .boxed();
        let mut listener = EventListener::new(
            HistoryPoller::new(engine.clone()),
            Some(stream),
            NodeId::from("9"),
        );
        let job = JobId::new("p1");

        assert!(listener.is_push());
        assert_eq!(listener.observe(&job).await.unwrap(), Observation::Running);
        assert_eq!(engine.history_calls(), 0);

        // Stream exhausted: the next observation comes from history.
        assert_matches!(
            listener.observe(&job).await.unwrap(),
            Observation::Completed { .. }
        );
        assert!(!listener.is_push());
        assert_eq!(engine.history_calls(), 1);
    }
}
