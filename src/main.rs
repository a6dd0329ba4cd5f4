// src/main.rs
//! VirtOps Engine diagnostics entry point
//!
//! Loads configuration, builds the execution stack, runs the environment
//! diagnostics, and prints the report. Exits nonzero when the environment
//! is unhealthy so operators can wire it into health checks.

use anyhow::Result;
use std::sync::Arc;
use tracing::info;
use virtops_engine::diagnostics::{DiagnosticsEngine, OverallStatus};
use virtops_engine::execution::ExecutionGateway;
use virtops_engine::observability::init_tracing;
use virtops_engine::utils::config::EngineConfig;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting VirtOps Engine v{}", env!("CARGO_PKG_VERSION"));

    let config = EngineConfig::load()?;
    info!("Configuration loaded: {:?}", config);

    let gateway = Arc::new(ExecutionGateway::from_engine_config(&config)?);
    let engine = DiagnosticsEngine::new(
        Arc::clone(&gateway),
        config.diagnostics.clone(),
        config.execution.interpreter,
    );

    let report = engine.run().await;

    for issue in &report.issues {
        println!(
            "[{:?}] {}: {} ({})",
            issue.severity, issue.category, issue.description, issue.recommendation
        );
    }
    for (category, detail) in &report.details {
        println!("{}: {}", category, detail);
    }
    println!("Overall: {:?}", report.status);

    gateway.shutdown().await;

    if report.status == OverallStatus::Unhealthy {
        std::process::exit(1);
    }
    Ok(())
}
