//! Model Context Protocol surface for the image generation pipeline.
//!
//! Speaks line-delimited JSON-RPC 2.0 over stdio and exposes a single
//! tool, `image_generate`.

pub mod protocol;
pub mod server;
pub mod tool;
