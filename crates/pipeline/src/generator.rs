//! The request pipeline.
//!
//! [`ImageGenerator`] owns everything a request needs that outlives it:
//! the engine, the loaded workflow, the configuration, and the persister.
//! Each call builds its own graph, client id, job handle and status
//! source, so concurrent calls share no mutable state.

use std::sync::Arc;

use imagegen_comfyui::engine::Engine;
use imagegen_core::aspect_ratio::Dimensions;
use imagegen_core::parameterize::{parameterize, random_seed};
use imagegen_core::request::GenerationRequest;
use imagegen_core::store::WorkflowStore;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, TokioClock};
use crate::config::{GeneratorConfig, TrackingMode};
use crate::error::GenerationError;
use crate::job::{JobId, JobHandle, Transition};
use crate::persister::{PersistedImage, Persister};
use crate::resolver::resolve;
use crate::status::{EventListener, HistoryPoller};
use crate::submitter::submit;
use crate::tracker::CompletionTracker;

/// Result of one successful generation.
#[derive(Debug, Clone, Serialize)]
pub struct GenerationOutcome {
    pub job_id: JobId,
    pub image: PersistedImage,
    /// `![title](locator)` for the persisted image.
    pub markdown: String,
    pub seed: u64,
    pub dimensions: Dimensions,
    pub transitions: Vec<Transition>,
}

pub struct ImageGenerator<E: ?Sized> {
    engine: Arc<E>,
    store: WorkflowStore,
    config: Arc<GeneratorConfig>,
    clock: Arc<dyn Clock>,
    tracker: CompletionTracker,
    persister: Persister,
}

impl<E: Engine + ?Sized> ImageGenerator<E> {
    pub fn new(engine: Arc<E>, store: WorkflowStore, config: Arc<GeneratorConfig>) -> Self {
        Self::with_clock(engine, store, config, Arc::new(TokioClock::new()))
    }

    /// Like [`ImageGenerator::new`] but tracking time through `clock`.
    pub fn with_clock(
        engine: Arc<E>,
        store: WorkflowStore,
        config: Arc<GeneratorConfig>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let tracker = CompletionTracker::new(Arc::clone(&clock), config.poll, config.timeout);
        let persister = Persister::new(
            config.output_dir.clone(),
            config.image_base_url.clone(),
            store.name(),
        )
        .with_prompt_sidecar(config.write_prompt_sidecar);

        Self {
            engine,
            store,
            config,
            clock,
            tracker,
            persister,
        }
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.engine
    }

    pub fn store(&self) -> &WorkflowStore {
        &self.store
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    /// Generate an image from raw tool arguments.
    pub async fn image_generate(
        &self,
        prompt: &str,
        title: &str,
        aspect_ratio: &str,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutcome, GenerationError> {
        let request = GenerationRequest::parse(prompt, title, aspect_ratio)?;
        self.generate(&request, cancel).await
    }

    /// Generate an image with a fresh random seed.
    pub async fn generate(
        &self,
        request: &GenerationRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutcome, GenerationError> {
        self.generate_with_seed(request, random_seed(), cancel).await
    }

    pub async fn generate_with_seed(
        &self,
        request: &GenerationRequest,
        seed: u64,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutcome, GenerationError> {
        let result = self.run(request, seed, cancel).await;
        if let Err(e) = &result {
            tracing::error!(
                kind = e.kind(),
                job_id = e.job_id().map(JobId::as_str),
                error = %e,
                "Image generation failed",
            );
        }
        result
    }

    async fn run(
        &self,
        request: &GenerationRequest,
        seed: u64,
        cancel: &CancellationToken,
    ) -> Result<GenerationOutcome, GenerationError> {
        let manifest = self.store.manifest();
        let save_node = manifest.save_image_node().clone();
        let graph = parameterize(self.store.template(), manifest, request, seed)?;
        let client_id = uuid::Uuid::new_v4().to_string();

        // Subscribe before submitting so no message for the job is missed.
        let stream = match self.config.tracking {
            TrackingMode::Poll => None,
            TrackingMode::Push => match self.engine.subscribe(&client_id).await {
                Ok(stream) => Some(stream),
                Err(e) => {
                    tracing::warn!(client_id = %client_id, error = %e, "WebSocket unavailable, polling instead");
                    None
                }
            },
        };

        let mut handle = submit(self.engine.as_ref(), &graph, &client_id).await?;
        let mut source = EventListener::new(
            HistoryPoller::new(Arc::clone(&self.engine)),
            stream,
            save_node.clone(),
        );

        if let Err(e) = self.tracker.track(&mut handle, &mut source, cancel).await {
            if matches!(e, GenerationError::TimedOut { .. }) && self.config.cancel_on_timeout {
                self.cancel_remote(&handle).await;
            }
            return Err(e);
        }

        let artifact = resolve(
            self.engine.as_ref(),
            &handle,
            &save_node,
            self.clock.as_ref(),
        )
        .await?;
        let image = self.persister.persist(&artifact, request).await?;

        tracing::info!(
            job_id = %handle.job_id(),
            file = %image.file_name,
            seed,
            "Image generated",
        );

        Ok(GenerationOutcome {
            job_id: handle.job_id().clone(),
            markdown: image.markdown(request.title()),
            image,
            seed,
            dimensions: graph.dimensions(),
            transitions: handle.transitions().to_vec(),
        })
    }

    async fn cancel_remote(&self, handle: &JobHandle) {
        let job_id = handle.job_id();
        match self.engine.cancel(job_id.as_str()).await {
            Ok(()) => tracing::info!(job_id = %job_id, "Cancelled timed-out job on ComfyUI"),
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Failed to cancel timed-out job")
            }
        }
    }
}
