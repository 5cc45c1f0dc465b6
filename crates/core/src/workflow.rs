//! Typed model of a ComfyUI API-format workflow.
//!
//! The engine accepts a JSON object keyed by node ID, where each value
//! carries a `class_type` and an `inputs` map:
//!
//! ```json
//! {
//!   "3": {
//!     "class_type": "KSampler",
//!     "inputs": { "seed": 42, "model": ["4", 0] }
//!   }
//! }
//! ```
//!
//! [`WorkflowTemplate`] keeps the nodes in document order and never
//! exposes mutable access. Request-specific copies are produced by
//! [`crate::parameterize`].

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Node IDs
// ---------------------------------------------------------------------------

/// Identifier of a node inside a workflow graph.
///
/// ComfyUI uses string keys (`"9"`, `"31:2"`), but binding manifests
/// written by hand often carry bare integers, so both deserialize.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum RawNodeId {
            Text(String),
            Number(u64),
        }

        Ok(match RawNodeId::deserialize(deserializer)? {
            RawNodeId::Text(s) => NodeId(s),
            RawNodeId::Number(n) => NodeId(n.to_string()),
        })
    }
}

// ---------------------------------------------------------------------------
// Input fields
// ---------------------------------------------------------------------------

/// Node input fields the parameterizer knows how to write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputField {
    Text,
    Width,
    Height,
    Seed,
    NoiseSeed,
}

impl InputField {
    /// Key of this field inside a node's `inputs` map.
    pub const fn key(self) -> &'static str {
        match self {
            InputField::Text => "text",
            InputField::Width => "width",
            InputField::Height => "height",
            InputField::Seed => "seed",
            InputField::NoiseSeed => "noise_seed",
        }
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// A single node of a workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    /// ComfyUI class type (e.g. "KSampler", "CLIPTextEncode").
    pub class_type: String,
    /// Literal values and links (`[source_node, output_index]`).
    #[serde(default)]
    pub inputs: serde_json::Map<String, Value>,
    /// Anything else the authoring tool stored on the node (`_meta`, ...).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl WorkflowNode {
    pub fn has_input(&self, field: InputField) -> bool {
        self.inputs.contains_key(field.key())
    }

    pub fn input(&self, field: InputField) -> Option<&Value> {
        self.inputs.get(field.key())
    }

    pub fn set_input(&mut self, field: InputField, value: impl Into<Value>) {
        self.inputs.insert(field.key().to_string(), value.into());
    }

    /// Overwrite the prompt text.
    pub fn set_text(&mut self, text: &str) {
        self.set_input(InputField::Text, text);
    }

    /// Overwrite `width` and `height`, touching only the fields the node
    /// already declares.
    pub fn set_dimensions(&mut self, width: u32, height: u32) {
        if self.has_input(InputField::Width) {
            self.set_input(InputField::Width, width);
        }
        if self.has_input(InputField::Height) {
            self.set_input(InputField::Height, height);
        }
    }

    /// Overwrite `seed` and/or `noise_seed`, whichever the node declares.
    pub fn set_seed(&mut self, seed: u64) {
        if self.has_input(InputField::Seed) {
            self.set_input(InputField::Seed, seed);
        }
        if self.has_input(InputField::NoiseSeed) {
            self.set_input(InputField::NoiseSeed, seed);
        }
    }

    /// Links from this node's inputs to upstream node outputs.
    pub fn links(&self) -> impl Iterator<Item = (&str, NodeId)> + '_ {
        self.inputs.iter().filter_map(|(name, value)| {
            let arr = value.as_array()?;
            if arr.len() != 2 || !arr[1].is_u64() {
                return None;
            }
            let from = if let Some(s) = arr[0].as_str() {
                NodeId::new(s)
            } else {
                NodeId::new(arr[0].as_u64()?.to_string())
            };
            Some((name.as_str(), from))
        })
    }
}

// ---------------------------------------------------------------------------
// Template
// ---------------------------------------------------------------------------

/// An immutable, pre-authored workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct WorkflowTemplate {
    nodes: IndexMap<NodeId, WorkflowNode>,
}

impl WorkflowTemplate {
    /// Parse a workflow from JSON text, keeping node order as written.
    pub fn from_json_str(text: &str) -> Result<Self, CoreError> {
        let raw: IndexMap<NodeId, Value> = serde_json::from_str(text).map_err(|e| {
            CoreError::MalformedWorkflow(format!("Workflow JSON must be an object of nodes: {e}"))
        })?;
        Self::from_raw(raw)
    }

    /// Build a template from an already-parsed JSON value.
    pub fn from_json(value: &Value) -> Result<Self, CoreError> {
        let obj = value.as_object().ok_or_else(|| {
            CoreError::MalformedWorkflow("Workflow JSON must be an object".to_string())
        })?;
        let raw = obj
            .iter()
            .map(|(id, node)| (NodeId::new(id.as_str()), node.clone()))
            .collect();
        Self::from_raw(raw)
    }

    fn from_raw(raw: IndexMap<NodeId, Value>) -> Result<Self, CoreError> {
        if raw.is_empty() {
            return Err(CoreError::MalformedWorkflow(
                "Workflow JSON must contain at least one node".to_string(),
            ));
        }

        let mut nodes = IndexMap::with_capacity(raw.len());
        for (node_id, value) in raw {
            if value.get("class_type").and_then(Value::as_str).is_none() {
                return Err(CoreError::MalformedWorkflow(format!(
                    "Node '{node_id}' is missing required 'class_type' field"
                )));
            }
            if let Some(inputs) = value.get("inputs") {
                if !inputs.is_object() {
                    return Err(CoreError::MalformedWorkflow(format!(
                        "Node '{node_id}' has non-object 'inputs'"
                    )));
                }
            }
            let node: WorkflowNode = serde_json::from_value(value).map_err(|e| {
                CoreError::MalformedWorkflow(format!("Node '{node_id}' is invalid: {e}"))
            })?;
            nodes.insert(node_id, node);
        }

        let template = Self { nodes };
        template.check_links()?;
        Ok(template)
    }

    /// Every link must point at a node that exists in the graph.
    fn check_links(&self) -> Result<(), CoreError> {
        for (node_id, node) in &self.nodes {
            for (input, from) in node.links() {
                if !self.nodes.contains_key(&from) {
                    return Err(CoreError::MalformedWorkflow(format!(
                        "Node '{node_id}' input '{input}' links to missing node '{from}'"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn node(&self, id: &NodeId) -> Option<&WorkflowNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&NodeId, &WorkflowNode)> {
        self.nodes.iter()
    }

    /// Deep copy of the node map for a single request.
    pub(crate) fn clone_nodes(&self) -> IndexMap<NodeId, WorkflowNode> {
        self.nodes.clone()
    }
}
