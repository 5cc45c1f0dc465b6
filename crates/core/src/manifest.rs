//! Binding manifest: which template nodes receive which request values.
//!
//! The manifest is a YAML (or JSON) document that sits next to the
//! workflow template:
//!
//! ```yaml
//! save_image_node: "9"
//! image_size_nodes: ["5"]
//! seed_nodes: ["25"]
//! prompt_nodes: ["6"]
//! aspect_ratios:
//!   "16:9": [1280, 720]
//! ```
//!
//! [`BindingManifest::validate_against`] must pass before the manifest
//! is used for any request.

use std::fmt;

use indexmap::{IndexMap, IndexSet};
use serde::Deserialize;

use crate::aspect_ratio::{AspectRatioEntry, AspectRatioTable};
use crate::error::CoreError;
use crate::workflow::{InputField, NodeId, WorkflowTemplate};

/// The parameter a bound node receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingRole {
    SaveImage,
    ImageSize,
    Seed,
    Prompt,
}

impl BindingRole {
    pub const fn label(self) -> &'static str {
        match self {
            BindingRole::SaveImage => "save_image",
            BindingRole::ImageSize => "image_size",
            BindingRole::Seed => "seed",
            BindingRole::Prompt => "prompt",
        }
    }
}

impl fmt::Display for BindingRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// On-disk shape of the manifest.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawManifest {
    #[serde(default)]
    aspect_ratios: Option<IndexMap<String, [u32; 2]>>,
    save_image_node: NodeId,
    #[serde(default)]
    image_size_nodes: IndexSet<NodeId>,
    #[serde(default)]
    seed_nodes: IndexSet<NodeId>,
    #[serde(default)]
    prompt_nodes: IndexSet<NodeId>,
}

/// Declared bindings from request parameters to template node IDs.
#[derive(Debug, Clone, PartialEq)]
pub struct BindingManifest {
    save_image_node: NodeId,
    image_size_nodes: IndexSet<NodeId>,
    seed_nodes: IndexSet<NodeId>,
    prompt_nodes: IndexSet<NodeId>,
    aspect_ratios: AspectRatioTable,
}

impl BindingManifest {
    pub fn new(
        save_image_node: NodeId,
        image_size_nodes: impl IntoIterator<Item = NodeId>,
        seed_nodes: impl IntoIterator<Item = NodeId>,
        prompt_nodes: impl IntoIterator<Item = NodeId>,
        aspect_ratios: AspectRatioTable,
    ) -> Self {
        Self {
            save_image_node,
            image_size_nodes: image_size_nodes.into_iter().collect(),
            seed_nodes: seed_nodes.into_iter().collect(),
            prompt_nodes: prompt_nodes.into_iter().collect(),
            aspect_ratios,
        }
    }

    /// Parse a YAML manifest.
    pub fn from_yaml_str(text: &str) -> Result<Self, CoreError> {
        let raw: RawManifest = serde_yaml::from_str(text)
            .map_err(|e| CoreError::MalformedManifest(e.to_string()))?;
        Self::from_raw(raw)
    }

    /// Parse a JSON manifest.
    pub fn from_json_str(text: &str) -> Result<Self, CoreError> {
        let raw: RawManifest = serde_json::from_str(text)
            .map_err(|e| CoreError::MalformedManifest(e.to_string()))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawManifest) -> Result<Self, CoreError> {
        // A missing or empty table means "use the defaults".
        let aspect_ratios = match raw.aspect_ratios {
            Some(map) if !map.is_empty() => AspectRatioTable::from_entries(map.into_iter().map(
                |(name, [width, height])| AspectRatioEntry {
                    name,
                    width,
                    height,
                },
            ))?,
            _ => AspectRatioTable::default(),
        };

        Ok(Self {
            save_image_node: raw.save_image_node,
            image_size_nodes: raw.image_size_nodes,
            seed_nodes: raw.seed_nodes,
            prompt_nodes: raw.prompt_nodes,
            aspect_ratios,
        })
    }

    /// Check every binding against `template`.
    ///
    /// Each referenced node must exist. Size nodes must declare `width`
    /// or `height`, and seed nodes must declare `seed` or `noise_seed`,
    /// otherwise the binding would silently do nothing.
    pub fn validate_against(&self, template: &WorkflowTemplate) -> Result<(), CoreError> {
        for (role, node_id) in self.bindings() {
            let node = template
                .node(node_id)
                .ok_or_else(|| CoreError::InvalidBinding {
                    node_id: node_id.clone(),
                    role,
                    reason: "does not exist in the workflow template".to_string(),
                })?;

            let usable = match role {
                BindingRole::ImageSize => {
                    node.has_input(InputField::Width) || node.has_input(InputField::Height)
                }
                BindingRole::Seed => {
                    node.has_input(InputField::Seed) || node.has_input(InputField::NoiseSeed)
                }
                BindingRole::SaveImage | BindingRole::Prompt => true,
            };
            if !usable {
                return Err(CoreError::InvalidBinding {
                    node_id: node_id.clone(),
                    role,
                    reason: format!(
                        "({}) has none of the inputs this binding writes",
                        node.class_type
                    ),
                });
            }
        }
        Ok(())
    }

    /// Every (role, node) pair, save node first.
    pub fn bindings(&self) -> impl Iterator<Item = (BindingRole, &NodeId)> {
        std::iter::once((BindingRole::SaveImage, &self.save_image_node))
            .chain(self.image_size_nodes.iter().map(|n| (BindingRole::ImageSize, n)))
            .chain(self.seed_nodes.iter().map(|n| (BindingRole::Seed, n)))
            .chain(self.prompt_nodes.iter().map(|n| (BindingRole::Prompt, n)))
    }

    pub fn save_image_node(&self) -> &NodeId {
        &self.save_image_node
    }

    pub fn image_size_nodes(&self) -> &IndexSet<NodeId> {
        &self.image_size_nodes
    }

    pub fn seed_nodes(&self) -> &IndexSet<NodeId> {
        &self.seed_nodes
    }

    pub fn prompt_nodes(&self) -> &IndexSet<NodeId> {
        &self.prompt_nodes
    }

    pub fn aspect_ratios(&self) -> &AspectRatioTable {
        &self.aspect_ratios
    }
}
