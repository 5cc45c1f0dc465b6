//! The engine seam used by the generation pipeline.
//!
//! [`Engine`] is the full surface the pipeline needs from ComfyUI:
//! submit a graph, inspect history and queue, fetch output bytes,
//! cancel, and optionally stream execution messages. [`ComfyUIEngine`]
//! implements it over HTTP and WebSocket; tests substitute
//! [`crate::testing::StubEngine`].

use async_trait::async_trait;
use imagegen_core::parameterize::ParameterizedGraph;

use crate::api::{ComfyUIApi, ComfyUIApiError, FetchedImage, SubmitResponse};
use crate::client::{ComfyUIClient, ComfyUIClientError};
use crate::history::{HistoryEntry, ImageRef, QueuePosition, QueueSnapshot};
use crate::stream::{message_stream, MessageStream};

#[async_trait]
pub trait Engine: Send + Sync {
    /// Queue `graph` for execution on behalf of `client_id`.
    async fn submit(
        &self,
        graph: &ParameterizedGraph,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError>;

    /// History entry for `prompt_id`, or `None` until it is recorded.
    async fn history(&self, prompt_id: &str) -> Result<Option<HistoryEntry>, ComfyUIApiError>;

    async fn queue(&self) -> Result<QueueSnapshot, ComfyUIApiError>;

    async fn fetch_image(&self, image: &ImageRef) -> Result<FetchedImage, ComfyUIApiError>;

    /// Best-effort removal of `prompt_id` from the queue, interrupting
    /// it if it is already running.
    async fn cancel(&self, prompt_id: &str) -> Result<(), ComfyUIApiError>;

    /// Open a push channel for messages addressed to `client_id`.
    async fn subscribe(&self, _client_id: &str) -> Result<MessageStream, ComfyUIClientError> {
        Err(ComfyUIClientError::Unsupported)
    }
}

/// A ComfyUI server reached over HTTP and WebSocket.
#[derive(Debug, Clone)]
pub struct ComfyUIEngine {
    api: ComfyUIApi,
    client: ComfyUIClient,
}

impl ComfyUIEngine {
    /// Engine at `http://{host}:{port}` / `ws://{host}:{port}`.
    pub fn new(host: &str, port: u16) -> Self {
        Self::from_urls(
            format!("http://{host}:{port}"),
            format!("ws://{host}:{port}"),
        )
    }

    pub fn from_urls(api_url: impl Into<String>, ws_url: impl Into<String>) -> Self {
        Self {
            api: ComfyUIApi::new(api_url),
            client: ComfyUIClient::new(ws_url),
        }
    }

    pub fn api(&self) -> &ComfyUIApi {
        &self.api
    }
}

#[async_trait]
impl Engine for ComfyUIEngine {
    async fn submit(
        &self,
        graph: &ParameterizedGraph,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        self.api.submit_workflow(graph, client_id).await
    }

    async fn history(&self, prompt_id: &str) -> Result<Option<HistoryEntry>, ComfyUIApiError> {
        self.api.get_history(prompt_id).await
    }

    async fn queue(&self) -> Result<QueueSnapshot, ComfyUIApiError> {
        self.api.get_queue().await
    }

    async fn fetch_image(&self, image: &ImageRef) -> Result<FetchedImage, ComfyUIApiError> {
        self.api.view_image(image).await
    }

    async fn cancel(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        self.api.cancel_execution(prompt_id).await?;
        if self.api.get_queue().await?.position(prompt_id) == QueuePosition::Running {
            self.api.interrupt(prompt_id).await?;
        }
        tracing::info!(prompt_id = %prompt_id, "Cancelled ComfyUI prompt");
        Ok(())
    }

    async fn subscribe(&self, client_id: &str) -> Result<MessageStream, ComfyUIClientError> {
        let connection = self.client.connect(client_id).await?;
        Ok(message_stream(connection))
    }
}
