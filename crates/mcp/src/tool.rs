//! The `image_generate` tool definition and call results.

use imagegen_core::request::AspectRatio;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

pub const IMAGE_GENERATE: &str = "image_generate";

/// Arguments of an `image_generate` call.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ImageGenerateArgs {
    pub prompt: String,
    pub title: String,
    pub aspect_ratio: String,
}

/// Tool descriptor returned from `tools/list`.
pub fn image_generate_tool() -> Value {
    let aliases: Vec<&str> = AspectRatio::ALL.iter().map(|ar| ar.alias()).collect();
    let described: Vec<String> = AspectRatio::ALL
        .iter()
        .map(|ar| format!("'{}' ({})", ar.alias(), ar.ratio_name()))
        .collect();

    json!({
        "name": IMAGE_GENERATE,
        "description": "Generate an image from a text prompt",
        "inputSchema": {
            "type": "object",
            "properties": {
                "prompt": {
                    "type": "string",
                    "description": "The text prompt for the image generation."
                },
                "title": {
                    "type": "string",
                    "description": "A short name (2 - 4 words) to title the image."
                },
                "aspect_ratio": {
                    "type": "string",
                    "enum": aliases,
                    "description": format!("Supported values are {}.", described.join(", "))
                }
            },
            "required": ["prompt", "title", "aspect_ratio"]
        }
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextContent {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: String,
}

/// Result of a `tools/call`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolResult {
    pub content: Vec<TextContent>,
    #[serde(rename = "isError")]
    pub is_error: bool,
}

impl ToolResult {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![TextContent {
                kind: "text",
                text: text.into(),
            }],
            is_error: false,
        }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self {
            is_error: true,
            ..Self::text(text)
        }
    }
}
