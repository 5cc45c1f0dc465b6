use std::path::PathBuf;

use crate::manifest::BindingRole;
use crate::workflow::NodeId;

/// Errors raised while loading workflows or building a job request.
///
/// Everything here is either a configuration-time failure (the process
/// should refuse to start) or a bad request (the caller should fix its
/// input). None of these are worth retrying.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Unknown aspect ratio '{name}'. Valid values: {valid}")]
    UnknownAspectRatio { name: String, valid: String },

    #[error("Invalid binding: {role} node '{node_id}' {reason}")]
    InvalidBinding {
        node_id: NodeId,
        role: BindingRole,
        reason: String,
    },

    #[error("Malformed workflow: {0}")]
    MalformedWorkflow(String),

    #[error("Malformed manifest: {0}")]
    MalformedManifest(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
