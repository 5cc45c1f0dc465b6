//! ComfyUI WebSocket and REST client library.
//!
//! Provides the HTTP API wrapper (submission, history, queue, image
//! retrieval, cancellation), typed history and WebSocket message
//! parsing, and the [`engine::Engine`] trait the generation pipeline
//! drives.

pub mod api;
pub mod client;
pub mod engine;
pub mod history;
pub mod messages;
pub mod stream;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
