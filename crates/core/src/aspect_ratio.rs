//! Aspect ratio table: symbolic ratio names mapped to pixel dimensions.
//!
//! A workflow's manifest may configure its own table. Names it does not
//! configure fall back to [`DEFAULT_ASPECT_RATIOS`].

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/* --------------------------------------------------------------------------
Named constants
-------------------------------------------------------------------------- */

/// Built-in dimensions used when a workflow does not configure a ratio.
pub const DEFAULT_ASPECT_RATIOS: &[(&str, u32, u32)] = &[
    ("16:9", 1280, 720),
    ("4:3", 1152, 864),
    ("1:1", 1024, 1024),
    ("3:4", 864, 1152),
    ("9:16", 720, 1280),
];

/// Maximum dimension (width or height) allowed.
const MAX_DIMENSION: u32 = 8192;

/// Latent-space models operate on 8px blocks.
const DIMENSION_ALIGNMENT: u32 = 8;

/* --------------------------------------------------------------------------
Types
-------------------------------------------------------------------------- */

/// Pixel dimensions of a generated image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Whether both sides are multiples of 8.
    pub fn is_engine_aligned(&self) -> bool {
        self.width % DIMENSION_ALIGNMENT == 0 && self.height % DIMENSION_ALIGNMENT == 0
    }
}

/// One named entry of an aspect ratio table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AspectRatioEntry {
    pub name: String,
    pub width: u32,
    pub height: u32,
}

/// Configured aspect ratios for one workflow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AspectRatioTable {
    entries: IndexMap<String, Dimensions>,
}

impl AspectRatioTable {
    /// A table containing exactly the built-in defaults.
    pub fn defaults() -> Self {
        Self {
            entries: DEFAULT_ASPECT_RATIOS
                .iter()
                .map(|&(name, w, h)| (name.to_string(), Dimensions::new(w, h)))
                .collect(),
        }
    }

    /// Build a table from explicit entries.
    ///
    /// Names must be unique and dimensions must pass
    /// [`validate_dimensions`]. Sizes that are not multiples of 8 are
    /// accepted but logged, since some models tolerate them.
    pub fn from_entries(
        entries: impl IntoIterator<Item = AspectRatioEntry>,
    ) -> Result<Self, CoreError> {
        let mut table = IndexMap::new();
        for entry in entries {
            validate_dimensions(entry.width, entry.height).map_err(|reason| {
                CoreError::MalformedManifest(format!("aspect ratio '{}': {reason}", entry.name))
            })?;
            let dims = Dimensions::new(entry.width, entry.height);
            if !dims.is_engine_aligned() {
                tracing::warn!(
                    name = %entry.name,
                    width = entry.width,
                    height = entry.height,
                    "Aspect ratio dimensions are not multiples of 8",
                );
            }
            if table.insert(entry.name.clone(), dims).is_some() {
                return Err(CoreError::MalformedManifest(format!(
                    "aspect ratio '{}' is defined more than once",
                    entry.name
                )));
            }
        }
        Ok(Self { entries: table })
    }

    /// Resolve a ratio name to dimensions.
    ///
    /// Looks at the configured entries first, then the built-in defaults.
    pub fn resolve(&self, name: &str) -> Result<Dimensions, CoreError> {
        if let Some(dims) = self.entries.get(name) {
            return Ok(*dims);
        }
        DEFAULT_ASPECT_RATIOS
            .iter()
            .find(|(default_name, _, _)| *default_name == name)
            .map(|&(_, w, h)| Dimensions::new(w, h))
            .ok_or_else(|| CoreError::UnknownAspectRatio {
                name: name.to_string(),
                valid: self.names().join(", "),
            })
    }

    /// Every resolvable name: configured entries, then unshadowed defaults.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.entries.keys().map(String::as_str).collect();
        for (name, _, _) in DEFAULT_ASPECT_RATIOS {
            if !self.entries.contains_key(*name) {
                names.push(*name);
            }
        }
        names
    }

    /// Whether the workflow configured no ratios of its own.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/* --------------------------------------------------------------------------
Validation functions
-------------------------------------------------------------------------- */

/// Validate that width and height are positive and within bounds.
pub fn validate_dimensions(width: u32, height: u32) -> Result<(), String> {
    if width == 0 || height == 0 {
        return Err("width and height must be greater than 0".to_string());
    }
    if width > MAX_DIMENSION || height > MAX_DIMENSION {
        return Err(format!(
            "dimensions must not exceed {MAX_DIMENSION}px (got {width}x{height})"
        ));
    }
    Ok(())
}

/* --------------------------------------------------------------------------
Tests
-------------------------------------------------------------------------- */
