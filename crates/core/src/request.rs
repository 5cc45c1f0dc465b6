//! Generation requests as received from the tool surface.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Maximum length of an image title.
pub const MAX_TITLE_LENGTH: usize = 200;

/// Symbolic aspect ratios exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AspectRatio {
    /// 16:9
    Widest,
    /// 4:3
    Wide,
    /// 1:1
    Square,
    /// 3:4
    Tall,
    /// 9:16
    Tallest,
}

impl AspectRatio {
    pub const ALL: [AspectRatio; 5] = [
        AspectRatio::Widest,
        AspectRatio::Wide,
        AspectRatio::Square,
        AspectRatio::Tall,
        AspectRatio::Tallest,
    ];

    /// Friendly name used by the tool schema.
    pub const fn alias(self) -> &'static str {
        match self {
            AspectRatio::Widest => "widest",
            AspectRatio::Wide => "wide",
            AspectRatio::Square => "square",
            AspectRatio::Tall => "tall",
            AspectRatio::Tallest => "tallest",
        }
    }

    /// Ratio name looked up in the workflow's aspect ratio table.
    pub const fn ratio_name(self) -> &'static str {
        match self {
            AspectRatio::Widest => "16:9",
            AspectRatio::Wide => "4:3",
            AspectRatio::Square => "1:1",
            AspectRatio::Tall => "3:4",
            AspectRatio::Tallest => "9:16",
        }
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.alias())
    }
}

impl FromStr for AspectRatio {
    type Err = CoreError;

    /// Accepts either the alias (`"wide"`) or the ratio (`"4:3"`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase();
        AspectRatio::ALL
            .into_iter()
            .find(|ar| ar.alias() == needle || ar.ratio_name() == needle)
            .ok_or_else(|| CoreError::UnknownAspectRatio {
                name: s.to_string(),
                valid: AspectRatio::ALL.map(AspectRatio::alias).join(", "),
            })
    }
}

/// One image request. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    prompt: String,
    title: String,
    aspect_ratio: AspectRatio,
}

impl GenerationRequest {
    /// Build a request, rejecting an empty prompt or an over-long title.
    pub fn new(
        prompt: impl Into<String>,
        title: impl Into<String>,
        aspect_ratio: AspectRatio,
    ) -> Result<Self, CoreError> {
        let prompt = prompt.into();
        let title = title.into();

        if prompt.trim().is_empty() {
            return Err(CoreError::InvalidRequest(
                "prompt must not be empty".to_string(),
            ));
        }
        if title.chars().count() > MAX_TITLE_LENGTH {
            return Err(CoreError::InvalidRequest(format!(
                "title must be at most {MAX_TITLE_LENGTH} characters"
            )));
        }

        Ok(Self {
            prompt,
            title,
            aspect_ratio,
        })
    }

    /// Build a request from raw tool arguments.
    pub fn parse(prompt: &str, title: &str, aspect_ratio: &str) -> Result<Self, CoreError> {
        Self::new(prompt, title, aspect_ratio.parse()?)
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn aspect_ratio(&self) -> AspectRatio {
        self.aspect_ratio
    }
}
