//! The image generation pipeline.
//!
//! One [`generator::ImageGenerator`] call runs a request through
//! parameterization, submission, completion tracking, result resolution
//! and persistence. Pipelines share nothing but the engine client and
//! the output directory, so any number may run concurrently.

pub mod backoff;
pub mod clock;
pub mod config;
pub mod error;
pub mod generator;
pub mod job;
pub mod persister;
pub mod resolver;
pub mod status;
pub mod submitter;
pub mod tracker;
