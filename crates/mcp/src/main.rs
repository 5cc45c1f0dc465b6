use std::sync::Arc;

use anyhow::Context;
use imagegen_comfyui::engine::ComfyUIEngine;
use imagegen_core::store::WorkflowStore;
use imagegen_mcp::server::McpServer;
use imagegen_pipeline::config::GeneratorConfig;
use imagegen_pipeline::generator::ImageGenerator;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    // stdout carries the protocol, so logs go to stderr.
    let json_logs = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "imagegen_mcp=info,imagegen_pipeline=info,imagegen_comfyui=info".into()
            }),
        )
        .with(json_logs.then(|| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
        }))
        .with((!json_logs).then(|| tracing_subscriber::fmt::layer().with_writer(std::io::stderr)))
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %format!("{e:#}"), "MCP server failed");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    // --- Configuration ---
    let config = GeneratorConfig::from_env().context("Invalid configuration")?;
    tracing::info!(
        comfyui_host = %config.comfyui_host,
        comfyui_port = config.comfyui_port,
        workflow = %config.workflow_name,
        tracking = ?config.tracking,
        "Loaded configuration",
    );

    // --- Workflow ---
    let store = WorkflowStore::load(&config.workflows_dir(), &config.workflow_name)
        .with_context(|| format!("Failed to load workflow '{}'", config.workflow_name))?;

    tokio::fs::create_dir_all(&config.output_dir)
        .await
        .with_context(|| format!("Failed to create {}", config.output_dir.display()))?;

    // --- Pipeline ---
    let engine = Arc::new(ComfyUIEngine::new(&config.comfyui_host, config.comfyui_port));
    let generator = Arc::new(ImageGenerator::new(engine, store, Arc::new(config)));
    let server = Arc::new(McpServer::new(generator));

    // --- Shutdown ---
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            signal.cancel();
        }
    });

    tracing::info!("MCP server listening on stdio");
    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    server
        .serve(stdin, tokio::io::stdout(), shutdown)
        .await
        .context("Failed to read from stdin")?;

    tracing::info!("MCP server stopped");
    Ok(())
}
