// Arcflow server: load the workflow, start the engine, serve the transfer
// service until interrupted, then drain gracefully.

mod service;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use arcflow_core::{Engine, EngineConfig, ProcessExecutor, Workflow};
use arcflow_protocol::TransferServiceServer;
use arcflow_storage::Database;

use service::TransferServiceImpl;

/// Bundled default workflow; override with ARCFLOW_WORKFLOW.
const DEFAULT_WORKFLOW: &str = include_str!("../assets/workflow.json");

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "arcflow=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("arcflow-server starting...");

    let config = EngineConfig::from_env();
    for dir in [
        &config.directories.processing,
        &config.directories.rejected,
        &config.directories.tmp,
    ] {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create {}", dir.display()))?;
    }

    // Open the database
    let database_url = std::env::var("ARCFLOW_DATABASE_URL").unwrap_or_else(|_| {
        format!(
            "sqlite://{}",
            config.directories.shared.join("arcflow.db").display()
        )
    });
    let db = Database::from_url(&database_url)
        .await
        .context("Failed to open database")?;
    db.migrate().await.context("Failed to run migrations")?;
    tracing::info!(url = %database_url, "database ready");

    // Load and validate the workflow; an invalid workflow aborts startup.
    let workflow = match std::env::var("ARCFLOW_WORKFLOW") {
        Ok(path) => Workflow::load(&path)
            .with_context(|| format!("Failed to load workflow from {path}"))?,
        Err(_) => Workflow::from_json(DEFAULT_WORKFLOW).context("Bundled workflow is invalid")?,
    };
    tracing::info!("workflow loaded");

    let engine = Arc::new(Engine::new(
        Arc::new(workflow),
        Arc::new(db),
        Arc::new(ProcessExecutor::new()),
        config,
    ));

    // Packages left mid-workflow by a previous run are resumable.
    let resumed = engine.resume_all().await?;
    if resumed > 0 {
        tracing::info!(count = resumed, "resumed unfinished packages");
    }

    // Start the processing loop
    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run().await })
    };

    // Serve the transfer service until interrupted
    let addr = std::env::var("ARCFLOW_BIND_ADDRESS")
        .unwrap_or_else(|_| "0.0.0.0:7000".to_string())
        .parse()
        .context("Invalid bind address")?;
    let transfer_service = TransferServiceImpl::new(engine.clone());
    tracing::info!(%addr, "listening");

    tonic::transport::Server::builder()
        .add_service(TransferServiceServer::new(transfer_service))
        .serve_with_shutdown(addr, async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await
        .context("Server error")?;

    // Drain the engine: no new jobs, in-flight jobs finish or are abandoned
    // at the deadline.
    engine.stop();
    runner.await.context("Processing loop panicked")?;
    tracing::info!("arcflow-server stopped");

    Ok(())
}
