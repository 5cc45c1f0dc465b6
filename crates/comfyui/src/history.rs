//! Typed views of the `/history/{id}` and `/queue` responses.

use std::collections::HashMap;

use serde::Deserialize;

/// One prompt's entry in `GET /history/{prompt_id}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryEntry {
    /// Outputs keyed by node id.
    #[serde(default)]
    pub outputs: HashMap<String, NodeOutput>,
    #[serde(default)]
    pub status: Option<HistoryStatus>,
}

/// Everything a single node produced.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NodeOutput {
    #[serde(default)]
    pub images: Vec<ImageRef>,
}

/// Reference to an output file, as accepted by `GET /view`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageRef {
    pub filename: String,
    #[serde(default)]
    pub subfolder: String,
    /// `output`, `temp` or `input`.
    #[serde(rename = "type", default = "default_folder_type")]
    pub folder_type: String,
}

fn default_folder_type() -> String {
    "output".to_string()
}

/// Execution status block of a history entry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HistoryStatus {
    #[serde(default)]
    pub status_str: String,
    #[serde(default)]
    pub completed: bool,
    /// `[[event_name, payload], ...]` as recorded by the server.
    #[serde(default)]
    pub messages: Vec<serde_json::Value>,
}

/// Failure details recovered from a history entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionFailure {
    pub node_id: Option<String>,
    pub message: String,
}

/// What a history entry says about its prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HistoryOutcome {
    Succeeded,
    Failed(ExecutionFailure),
    /// Recorded but not yet finished.
    InProgress,
}

impl HistoryEntry {
    /// Classify the entry.
    ///
    /// Entries written by older servers carry no status block; for those
    /// the presence of any output counts as success.
    pub fn outcome(&self) -> HistoryOutcome {
        let Some(status) = &self.status else {
            return if self.outputs.is_empty() {
                HistoryOutcome::InProgress
            } else {
                HistoryOutcome::Succeeded
            };
        };

        if status.status_str == "error" {
            return HistoryOutcome::Failed(status.failure());
        }
        if status.completed || status.status_str == "success" {
            HistoryOutcome::Succeeded
        } else {
            HistoryOutcome::InProgress
        }
    }

    /// Images produced by `node_id`, in the order the server listed them.
    pub fn images_for(&self, node_id: &str) -> &[ImageRef] {
        self.outputs
            .get(node_id)
            .map(|out| out.images.as_slice())
            .unwrap_or_default()
    }
}

impl HistoryStatus {
    fn failure(&self) -> ExecutionFailure {
        for message in &self.messages {
            let name = message.get(0).and_then(serde_json::Value::as_str);
            let (Some(name), Some(payload)) = (name, message.get(1)) else {
                continue;
            };
            if name != "execution_error" && name != "execution_interrupted" {
                continue;
            }
            let node_id = payload
                .get("node_id")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string);
            let message = payload
                .get("exception_message")
                .and_then(serde_json::Value::as_str)
                .map(|m| m.trim().to_string())
                .unwrap_or_else(|| name.replace('_', " "));
            return ExecutionFailure { node_id, message };
        }
        ExecutionFailure {
            node_id: None,
            message: "execution failed without an error message".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue
// ---------------------------------------------------------------------------

/// Where a prompt sits in the engine's queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePosition {
    Running,
    /// Zero-based position among pending prompts.
    Pending(usize),
    Absent,
}

/// Prompt ids from `GET /queue`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueSnapshot {
    pub running: Vec<String>,
    pub pending: Vec<String>,
}

impl QueueSnapshot {
    /// Parse the raw queue response.
    ///
    /// Each queue item is an array whose second element is the prompt
    /// id. Items that do not fit that shape are skipped.
    pub fn from_value(value: &serde_json::Value) -> Self {
        let ids = |key: &str| -> Vec<String> {
            value
                .get(key)
                .and_then(serde_json::Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|item| item.get(1).and_then(serde_json::Value::as_str))
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default()
        };
        Self {
            running: ids("queue_running"),
            pending: ids("queue_pending"),
        }
    }

    pub fn position(&self, prompt_id: &str) -> QueuePosition {
        if self.running.iter().any(|id| id == prompt_id) {
            return QueuePosition::Running;
        }
        self.pending
            .iter()
            .position(|id| id == prompt_id)
            .map_or(QueuePosition::Absent, QueuePosition::Pending)
    }
}
