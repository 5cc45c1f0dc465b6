//! Output file naming.
//!
//! Persisted images are named
//! `{YYYY-MM-DD_HH-MM-SS}_{title-slug}_{workflow}{-N}.{ext}`, where `-N`
//! only appears when an earlier name was already taken.
//!
//! ```
//! use imagegen_core::naming::{image_stem, slugify};
//!
//! assert_eq!(slugify("Mountain Sunset"), "mountain-sunset");
//! assert_eq!(
//!     image_stem("2025-01-02_03-04-05", "mountain-sunset", "flux-krea", 0),
//!     "2025-01-02_03-04-05_mountain-sunset_flux-krea"
//! );
//! ```

use crate::types::Timestamp;

/// Slug used when a title contains nothing usable.
pub const UNTITLED_SLUG: &str = "untitled";

/// Longest slug kept in a filename.
pub const MAX_SLUG_LENGTH: usize = 64;

/// Extension used when the payload format cannot be determined.
pub const DEFAULT_IMAGE_EXTENSION: &str = "png";

/// Timestamp layout used in filenames. Contains no `:` so the names are
/// valid on every filesystem.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

/// Generate a filesystem-safe slug from a title.
///
/// Converts to lowercase, replaces anything that is not ASCII
/// alphanumeric with hyphens, collapses consecutive hyphens, trims
/// leading/trailing hyphens and caps the length.
pub fn slugify(title: &str) -> String {
    let mut result = String::with_capacity(title.len());
    let mut prev_hyphen = true;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            result.push(c.to_ascii_lowercase());
            prev_hyphen = false;
        } else if !prev_hyphen {
            result.push('-');
            prev_hyphen = true;
        }
    }

    let mut slug = result.trim_end_matches('-').to_string();
    if slug.len() > MAX_SLUG_LENGTH {
        slug.truncate(MAX_SLUG_LENGTH);
        slug = slug.trim_end_matches('-').to_string();
    }
    if slug.is_empty() {
        UNTITLED_SLUG.to_string()
    } else {
        slug
    }
}

/// Sanitize a workflow name for use inside a filename.
///
/// Workflow names are operator-chosen file stems, so case and
/// underscores are kept; anything else unsafe becomes a hyphen.
pub fn sanitize_component(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

/// Format a timestamp for the leading filename component.
pub fn timestamp_component(at: &Timestamp) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

/// Build the filename stem for the `attempt`-th candidate name.
///
/// Attempt 0 has no suffix; attempt `n` appends `-{n + 1}`.
pub fn image_stem(timestamp: &str, title_slug: &str, workflow: &str, attempt: u32) -> String {
    let mut stem = format!("{timestamp}_{title_slug}_{}", sanitize_component(workflow));
    if attempt > 0 {
        stem.push('-');
        stem.push_str(&(attempt + 1).to_string());
    }
    stem
}

/// Pick a file extension for an image payload.
///
/// The payload's magic bytes win, then the declared content type, then
/// the engine-side filename, then [`DEFAULT_IMAGE_EXTENSION`].
pub fn image_extension(
    bytes: &[u8],
    content_type: Option<&str>,
    source_name: Option<&str>,
) -> String {
    let from_format = |format: image::ImageFormat| {
        format
            .extensions_str()
            .first()
            .map(|ext| (*ext).to_string())
    };

    if let Some(ext) = image::guess_format(bytes).ok().and_then(from_format) {
        return ext;
    }
    if let Some(ext) = content_type
        .and_then(|ct| ct.split(';').next())
        .and_then(|mime| image::ImageFormat::from_mime_type(mime.trim()))
        .and_then(from_format)
    {
        return ext;
    }
    if let Some(ext) = source_name
        .and_then(|name| std::path::Path::new(name).extension())
        .and_then(|ext| ext.to_str())
        .filter(|ext| !ext.is_empty() && ext.chars().all(|c| c.is_ascii_alphanumeric()))
    {
        return ext.to_ascii_lowercase();
    }
    DEFAULT_IMAGE_EXTENSION.to_string()
}
