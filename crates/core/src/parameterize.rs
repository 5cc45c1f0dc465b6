//! Request-specific workflow graphs.
//!
//! [`parameterize`] deep-copies a [`WorkflowTemplate`] and writes the
//! prompt, resolved dimensions and seed into the bound nodes. The
//! template itself is never touched, so any number of requests can be
//! parameterized from the same template concurrently.

use indexmap::IndexMap;
use rand::Rng;
use serde::{Serialize, Serializer};

use crate::aspect_ratio::Dimensions;
use crate::error::CoreError;
use crate::manifest::{BindingManifest, BindingRole};
use crate::request::GenerationRequest;
use crate::workflow::{NodeId, WorkflowNode, WorkflowTemplate};

/// Seeds are drawn from `0..MAX_SEED`.
pub const MAX_SEED: u64 = 10_000_000_000;

/// Draw a fresh random seed for one request.
pub fn random_seed() -> u64 {
    rand::rng().random_range(0..MAX_SEED)
}

/// A workflow graph ready for submission to the engine.
///
/// Serializes to exactly the node map the engine expects.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterizedGraph {
    nodes: IndexMap<NodeId, WorkflowNode>,
    dimensions: Dimensions,
    seed: u64,
}

impl ParameterizedGraph {
    pub fn node(&self, id: &NodeId) -> Option<&WorkflowNode> {
        self.nodes.get(id)
    }

    pub fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn to_json(&self) -> serde_json::Value {
        // A map of plain structs with string keys cannot fail to serialize.
        serde_json::to_value(&self.nodes).unwrap_or_default()
    }

    /// Serialized JSON bytes, stable for identical inputs.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(&self.nodes).unwrap_or_default()
    }
}

impl Serialize for ParameterizedGraph {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.nodes.serialize(serializer)
    }
}

/// Build the graph for one request.
///
/// Resolves the request's aspect ratio through the manifest's table,
/// then writes the prompt into every prompt node, the dimensions into
/// every size node, and `seed` into every seed node. Deterministic for
/// identical inputs.
pub fn parameterize(
    template: &WorkflowTemplate,
    manifest: &BindingManifest,
    request: &GenerationRequest,
    seed: u64,
) -> Result<ParameterizedGraph, CoreError> {
    let dimensions = manifest
        .aspect_ratios()
        .resolve(request.aspect_ratio().ratio_name())?;

    let mut nodes = template.clone_nodes();

    for node_id in manifest.prompt_nodes() {
        bound_node(&mut nodes, node_id, BindingRole::Prompt)?.set_text(request.prompt());
    }
    for node_id in manifest.image_size_nodes() {
        bound_node(&mut nodes, node_id, BindingRole::ImageSize)?
            .set_dimensions(dimensions.width, dimensions.height);
    }
    for node_id in manifest.seed_nodes() {
        bound_node(&mut nodes, node_id, BindingRole::Seed)?.set_seed(seed);
    }
    if !nodes.contains_key(manifest.save_image_node()) {
        return Err(missing(manifest.save_image_node(), BindingRole::SaveImage));
    }

    Ok(ParameterizedGraph {
        nodes,
        dimensions,
        seed,
    })
}

fn bound_node<'a>(
    nodes: &'a mut IndexMap<NodeId, WorkflowNode>,
    node_id: &NodeId,
    role: BindingRole,
) -> Result<&'a mut WorkflowNode, CoreError> {
    nodes.get_mut(node_id).ok_or_else(|| missing(node_id, role))
}

fn missing(node_id: &NodeId, role: BindingRole) -> CoreError {
    CoreError::InvalidBinding {
        node_id: node_id.clone(),
        role,
        reason: "does not exist in the workflow template".to_string(),
    }
}
