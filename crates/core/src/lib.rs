//! Pure domain layer for ComfyUI-backed image generation.
//!
//! Holds the typed node graph, the binding manifest that says which
//! nodes receive the prompt, seed and image size, the aspect ratio
//! table, request types, the parameterizer, and output naming. Nothing
//! in this crate touches the network.

pub mod aspect_ratio;
pub mod error;
pub mod manifest;
pub mod naming;
pub mod parameterize;
pub mod request;
pub mod store;
pub mod types;
pub mod workflow;
