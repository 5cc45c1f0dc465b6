//! In-memory [`Engine`] for offline tests.
//!
//! [`StubEngine`] accepts every submission and, by default, reports the
//! prompt finished on the first history lookup with one image on the
//! save node whose bytes are the configured payload.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use imagegen_core::parameterize::ParameterizedGraph;

use crate::api::{ComfyUIApiError, FetchedImage, SubmitResponse};
use crate::client::ComfyUIClientError;
use crate::engine::Engine;
use crate::history::{HistoryEntry, HistoryStatus, ImageRef, NodeOutput, QueueSnapshot};
use crate::messages::ComfyUIMessage;
use crate::stream::MessageStream;

/// Prompt id the stub assigns to its `n`-th submission (1-based).
pub fn stub_prompt_id(n: usize) -> String {
    format!("stub-prompt-{n}")
}

#[derive(Debug, Clone)]
enum Outcome {
    Succeed,
    SucceedWithoutImages,
    Fail(String),
    Never,
}

/// Scriptable stand-in for a ComfyUI server.
#[derive(Debug)]
pub struct StubEngine {
    save_node: String,
    payload: Vec<u8>,
    content_type: Option<String>,
    outcome: Outcome,
    pending_polls: usize,
    reject_with: Option<String>,
    fail_fetch: bool,
    push_messages: Option<Vec<ComfyUIMessage>>,

    submitted: Mutex<Vec<(serde_json::Value, String)>>,
    cancelled: Mutex<Vec<String>>,
    history_calls: AtomicUsize,
}

impl StubEngine {
    /// Completes immediately with `payload` on `save_node`.
    pub fn new(save_node: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            save_node: save_node.into(),
            payload: payload.into(),
            content_type: Some("image/png".to_string()),
            outcome: Outcome::Succeed,
            pending_polls: 0,
            reject_with: None,
            fail_fetch: false,
            push_messages: None,
            submitted: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            history_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_content_type(mut self, content_type: Option<&str>) -> Self {
        self.content_type = content_type.map(str::to_string);
        self
    }

    /// History stays empty (job running) for the first `polls` lookups.
    pub fn pending_for(mut self, polls: usize) -> Self {
        self.pending_polls = polls;
        self
    }

    /// The job never appears in history.
    pub fn never_completing(mut self) -> Self {
        self.outcome = Outcome::Never;
        self
    }

    /// History reports an execution error with `message`.
    pub fn failing(mut self, message: impl Into<String>) -> Self {
        self.outcome = Outcome::Fail(message.into());
        self
    }

    /// History reports success but the save node produced nothing.
    pub fn without_images(mut self) -> Self {
        self.outcome = Outcome::SucceedWithoutImages;
        self
    }

    /// `/prompt` answers 400 with `body`.
    pub fn rejecting(mut self, body: impl Into<String>) -> Self {
        self.reject_with = Some(body.into());
        self
    }

    /// `/view` answers 500.
    pub fn failing_fetch(mut self) -> Self {
        self.fail_fetch = true;
        self
    }

    /// Support push subscriptions, replaying `messages` then closing.
    pub fn with_push_messages(mut self, messages: Vec<ComfyUIMessage>) -> Self {
        self.push_messages = Some(messages);
        self
    }

    /// Every submitted graph with its client id, in order.
    pub fn submissions(&self) -> Vec<(serde_json::Value, String)> {
        self.submitted
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn history_calls(&self) -> usize {
        self.history_calls.load(Ordering::SeqCst)
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn entry(&self) -> Option<HistoryEntry> {
        let status = |status_str: &str, completed: bool, messages| HistoryStatus {
            status_str: status_str.to_string(),
            completed,
            messages,
        };

        match &self.outcome {
            Outcome::Never => None,
            Outcome::Succeed => {
                let mut entry = HistoryEntry {
                    status: Some(status("success", true, Vec::new())),
                    ..Default::default()
                };
                entry.outputs.insert(
                    self.save_node.clone(),
                    NodeOutput {
                        images: vec![ImageRef {
                            filename: "ComfyUI_00001_.png".to_string(),
                            subfolder: String::new(),
                            folder_type: "output".to_string(),
                        }],
                    },
                );
                Some(entry)
            }
            Outcome::SucceedWithoutImages => Some(HistoryEntry {
                status: Some(status("success", true, Vec::new())),
                ..Default::default()
            }),
            Outcome::Fail(message) => Some(HistoryEntry {
                status: Some(status(
                    "error",
                    false,
                    vec![serde_json::json!([
                        "execution_error",
                        {"node_id": self.save_node, "exception_message": message}
                    ])],
                )),
                ..Default::default()
            }),
        }
    }
}

#[async_trait]
impl Engine for StubEngine {
    async fn submit(
        &self,
        graph: &ParameterizedGraph,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        if let Some(body) = &self.reject_with {
            return Err(ComfyUIApiError::ApiError {
                status: 400,
                body: body.clone(),
            });
        }
        let mut submitted = self.submitted.lock().unwrap_or_else(|e| e.into_inner());
        submitted.push((graph.to_json(), client_id.to_string()));
        Ok(SubmitResponse {
            prompt_id: stub_prompt_id(submitted.len()),
            number: submitted.len() as i64,
            node_errors: serde_json::json!({}),
        })
    }

    async fn history(&self, _prompt_id: &str) -> Result<Option<HistoryEntry>, ComfyUIApiError> {
        let call = self.history_calls.fetch_add(1, Ordering::SeqCst);
        if call < self.pending_polls {
            return Ok(None);
        }
        Ok(self.entry())
    }

    async fn queue(&self) -> Result<QueueSnapshot, ComfyUIApiError> {
        let submitted = self.submitted.lock().unwrap_or_else(|e| e.into_inner());
        Ok(QueueSnapshot {
            running: (1..=submitted.len()).map(stub_prompt_id).collect(),
            pending: Vec::new(),
        })
    }

    async fn fetch_image(&self, _image: &ImageRef) -> Result<FetchedImage, ComfyUIApiError> {
        if self.fail_fetch {
            return Err(ComfyUIApiError::ApiError {
                status: 500,
                body: "view failed".to_string(),
            });
        }
        Ok(FetchedImage {
            bytes: self.payload.clone(),
            content_type: self.content_type.clone(),
        })
    }

    async fn cancel(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        self.cancelled
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(prompt_id.to_string());
        Ok(())
    }

    async fn subscribe(&self, _client_id: &str) -> Result<MessageStream, ComfyUIClientError> {
        use futures::StreamExt;

        match &self.push_messages {
            Some(messages) => Ok(futures::stream::iter(messages.clone()).boxed()),
            None => Err(ComfyUIClientError::Unsupported),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryOutcome;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn default_stub_succeeds_on_first_lookup() {
        let stub = StubEngine::new("9", b"png".to_vec());
        let entry = stub.history("stub-prompt-1").await.unwrap().unwrap();
        assert_eq!(entry.outcome(), HistoryOutcome::Succeeded);
        assert_eq!(entry.images_for("9").len(), 1);
    }

    #[tokio::test]
    async fn pending_then_done() {
        let stub = StubEngine::new("9", Vec::new()).pending_for(2);
        assert!(stub.history("p").await.unwrap().is_none());
        assert!(stub.history("p").await.unwrap().is_none());
        assert!(stub.history("p").await.unwrap().is_some());
        assert_eq!(stub.history_calls(), 3);
    }

    #[tokio::test]
    async fn failing_stub_reports_error_outcome() {
        let stub = StubEngine::new("9", Vec::new()).failing("boom");
        let entry = stub.history("p").await.unwrap().unwrap();
        assert_matches!(entry.outcome(), HistoryOutcome::Failed(f) if f.message == "boom");
    }

    #[tokio::test]
    async fn subscribe_unsupported_by_default() {
        let stub = StubEngine::new("9", Vec::new());
        assert!(matches!(
            stub.subscribe("c").await,
            Err(ComfyUIClientError::Unsupported)
        ));
    }
}
