//! The MCP server: request dispatch and the stdio session loop.
//!
//! Requests other than `tools/call` are answered inline. Each tool call
//! runs as its own task so a long generation never blocks `ping` or a
//! second call. Responses from all tasks funnel through one writer task.

use std::collections::HashMap;
use std::sync::Arc;

use imagegen_comfyui::engine::Engine;
use imagegen_pipeline::generator::ImageGenerator;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::protocol::{parse_request, RpcError, RpcRequest, RpcResponse, INTERNAL_ERROR};
use crate::tool::{image_generate_tool, ImageGenerateArgs, ToolResult, IMAGE_GENERATE};

pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const SERVER_NAME: &str = "comfyui-mcp-server";

pub struct McpServer<E: ?Sized> {
    generator: Arc<ImageGenerator<E>>,
    /// Cancellation handles of running tool calls, keyed by request id.
    in_flight: Mutex<HashMap<String, CancellationToken>>,
}

impl<E: Engine + ?Sized + 'static> McpServer<E> {
    pub fn new(generator: Arc<ImageGenerator<E>>) -> Self {
        Self {
            generator,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// Answer one request. Returns `None` for notifications.
    pub async fn handle(
        &self,
        request: RpcRequest,
        cancel: &CancellationToken,
    ) -> Option<RpcResponse> {
        let result = match request.method.as_str() {
            "initialize" => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {"listChanged": false}},
                "serverInfo": {"name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION")},
            })),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({"tools": [image_generate_tool()]})),
            "tools/call" => self.call_tool(&request.params, cancel).await,
            "notifications/initialized" => return None,
            "notifications/cancelled" => {
                self.cancel_request(&request.params).await;
                return None;
            }
            method => Err(RpcError::method_not_found(method)),
        };

        let id = request.id?;
        Some(match result {
            Ok(value) => RpcResponse::success(id, value),
            Err(error) => RpcResponse::failure(id, error),
        })
    }

    async fn call_tool(
        &self,
        params: &Value,
        cancel: &CancellationToken,
    ) -> Result<Value, RpcError> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| RpcError::invalid_params("missing tool name"))?;
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        let result = if name == IMAGE_GENERATE {
            self.image_generate(arguments, cancel).await
        } else {
            tracing::warn!(tool = %name, "Unknown tool requested");
            ToolResult::error(format!("Unknown tool: {name}"))
        };
        serde_json::to_value(result).map_err(|e| RpcError::new(INTERNAL_ERROR, e.to_string()))
    }

    async fn image_generate(&self, arguments: Value, cancel: &CancellationToken) -> ToolResult {
        let args: ImageGenerateArgs = match serde_json::from_value(arguments) {
            Ok(args) => args,
            Err(e) => {
                return ToolResult::error(format!(
                    "Error generating image: invalid arguments: {e}"
                ))
            }
        };
        tracing::info!(title = %args.title, aspect_ratio = %args.aspect_ratio, "image_generate called");

        match self
            .generator
            .image_generate(&args.prompt, &args.title, &args.aspect_ratio, cancel)
            .await
        {
            Ok(outcome) => ToolResult::text(outcome.markdown),
            Err(e) => ToolResult::error(format!("Error generating image: {e}")),
        }
    }

    async fn cancel_request(&self, params: &Value) {
        let Some(request_id) = params.get("requestId") else {
            return;
        };
        if let Some(token) = self.in_flight.lock().await.get(&request_id.to_string()) {
            tracing::info!(request_id = %request_id, "Tool call cancelled by client");
            token.cancel();
        }
    }

    /// Serve line-delimited JSON-RPC from `reader` to `writer` until EOF
    /// or `shutdown` fires.
    ///
    /// Tool calls still running at EOF are finished and answered before
    /// returning; `shutdown` cancels them instead.
    pub async fn serve<R, W>(
        self: Arc<Self>,
        reader: R,
        writer: W,
        shutdown: CancellationToken,
    ) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let tasks = TaskTracker::new();
        let (tx, rx) = mpsc::unbounded_channel::<RpcResponse>();
        let writer_task = tokio::spawn(write_responses(rx, writer));

        let mut lines = reader.lines();
        let read_result = loop {
            let line = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                line = lines.next_line() => line,
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };
            if line.trim().is_empty() {
                continue;
            }

            let request = match parse_request(&line) {
                Ok(request) => request,
                Err(error) => {
                    tracing::warn!(error = %error, "Rejected malformed message");
                    let _ = tx.send(RpcResponse::failure(Value::Null, error));
                    continue;
                }
            };

            let spawned_key = match (&request.id, request.method.as_str()) {
                (Some(id), "tools/call") => Some(id.to_string()),
                _ => None,
            };
            match spawned_key {
                Some(key) => {
                    let token = shutdown.child_token();
                    self.in_flight.lock().await.insert(key.clone(), token.clone());

                    let server = Arc::clone(&self);
                    let tx = tx.clone();
                    tasks.spawn(async move {
                        let response = server.handle(request, &token).await;
                        server.in_flight.lock().await.remove(&key);
                        if let Some(response) = response {
                            let _ = tx.send(response);
                        }
                    });
                }
                None => {
                    if let Some(response) = self.handle(request, &shutdown).await {
                        let _ = tx.send(response);
                    }
                }
            }
        };

        tasks.close();
        tasks.wait().await;
        drop(tx);
        if let Err(e) = writer_task.await {
            tracing::error!(error = %e, "Response writer task failed");
        }
        read_result
    }
}

async fn write_responses<W>(mut rx: mpsc::UnboundedReceiver<RpcResponse>, mut writer: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(response) = rx.recv().await {
        let mut line = match serde_json::to_vec(&response) {
            Ok(line) => line,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode response");
                continue;
            }
        };
        line.push(b'\n');
        if let Err(e) = writer.write_all(&line).await {
            tracing::debug!(error = %e, "Output closed");
            break;
        }
        if let Err(e) = writer.flush().await {
            tracing::debug!(error = %e, "Output closed");
            break;
        }
    }
}
