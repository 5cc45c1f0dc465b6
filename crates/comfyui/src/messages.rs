//! Typed ComfyUI WebSocket events.
//!
//! Every text frame is `{"type": "<event>", "data": {...}}`. Only the
//! events that say something about a prompt's lifecycle are modelled;
//! anything else fails to parse and is skipped by the stream.

use serde::de::IgnoredAny;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ComfyUIMessage {
    /// Queue-depth broadcast. Not tied to a prompt.
    Status(IgnoredAny),
    ExecutionStart(PromptEvent),
    ExecutionCached(CachedNodes),
    /// `node: None` marks the end of the prompt on servers that do not
    /// send `execution_success`.
    Executing(NodeEvent),
    Progress(StepProgress),
    Executed(NodeOutputEvent),
    ExecutionSuccess(PromptEvent),
    ExecutionError(ErrorEvent),
    ExecutionInterrupted(InterruptEvent),
}

impl ComfyUIMessage {
    /// The prompt this message is about, if it is about one.
    pub fn prompt_id(&self) -> Option<&str> {
        let id = match self {
            ComfyUIMessage::Status(_) => return None,
            ComfyUIMessage::Progress(p) => return p.prompt_id.as_deref(),
            ComfyUIMessage::ExecutionStart(e) | ComfyUIMessage::ExecutionSuccess(e) => &e.prompt_id,
            ComfyUIMessage::ExecutionCached(e) => &e.prompt_id,
            ComfyUIMessage::Executing(e) => &e.prompt_id,
            ComfyUIMessage::Executed(e) => &e.prompt_id,
            ComfyUIMessage::ExecutionError(e) => &e.prompt_id,
            ComfyUIMessage::ExecutionInterrupted(e) => &e.prompt_id,
        };
        Some(id.as_str())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptEvent {
    pub prompt_id: String,
    /// Server time in milliseconds.
    #[serde(default)]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CachedNodes {
    pub prompt_id: String,
    #[serde(default)]
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeEvent {
    pub prompt_id: String,
    pub node: Option<String>,
}

/// Sampler step progress. Older servers omit `prompt_id` and `node`.
#[derive(Debug, Clone, Deserialize)]
pub struct StepProgress {
    pub value: u32,
    pub max: u32,
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeOutputEvent {
    pub prompt_id: String,
    pub node: String,
    /// The node's UI output, e.g. `{"images": [...]}` for a save node.
    pub output: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorEvent {
    pub prompt_id: String,
    pub node_id: String,
    #[serde(default)]
    pub node_type: String,
    pub exception_type: String,
    pub exception_message: String,
    #[serde(default)]
    pub traceback: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InterruptEvent {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
}

/// Parse one text frame. Unknown event types are an error.
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    serde_json::from_str(text)
}
