//! # Instrument Health Monitor
//!
//! Model Context Protocol server that lets a display inspect and manage the
//! health status of laboratory instrument sessions.
//!
//! ## Overview
//!
//! This server provides MCP tools for:
//! - Status inspection (list, get)
//! - Cleanup (remove one entry, clear by status)
//! - Alert policy (show, edit)
//! - Reconciliation (stale-owner check, liveness pass)
//!
//! ## Architecture
//!
//! This is Layer 3 - the monitor binary that ties together:
//! - instrument-health-core: Core types and configuration
//! - instrument-health-registry: Status registry and state file
//! - instrument-health-reconcile: Liveness reconciliation

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use rmcp::{transport::stdio, ServiceExt};

use instrument_health::{HealthMcpServer, HealthMonitor};
use instrument_health_core::HealthConfig;

/// Value following `flag` on the command line.
fn arg_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|arg| arg == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args: Vec<String> = std::env::args().collect();
    let mut config = match arg_value(&args, "--config") {
        Some(path) => HealthConfig::from_file(&path)
            .with_context(|| format!("Failed to load config from {path}"))?,
        None => HealthConfig::default(),
    };
    if let Some(state_file) = arg_value(&args, "--state-file") {
        let path = PathBuf::from(state_file);
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            config.monitor.state_dir = Some(dir.to_path_buf());
        }
        if let Some(name) = path.file_name() {
            config.monitor.state_file = name.to_string_lossy().into_owned();
        }
        config.validate().context("Invalid --state-file")?;
    }

    // Initialize logging; stdout carries the MCP transport
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.monitor.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        "Instrument Health Monitor v{} starting...",
        env!("CARGO_PKG_VERSION")
    );

    let monitor = Arc::new(HealthMonitor::from_config(&config)?);
    let stale = monitor.reconciler().stale_pass().await;
    tracing::info!("Startup stale pass updated {} entr(ies)", stale);
    monitor.reconciler().start();

    let server = HealthMcpServer::new(Arc::clone(&monitor));

    tracing::info!("Server initialized, starting stdio transport...");

    // Serve the MCP server over stdio
    let service = server.serve(stdio()).await.map_err(|e| {
        tracing::error!("Error starting server: {}", e);
        e
    })?;

    tracing::info!(
        "Instrument Health Monitor running on stdio (state file: {})",
        config.state_path().display()
    );

    // Wait for the service to complete
    service.waiting().await?;

    monitor.reconciler().stop().await;
    tracing::info!("Instrument Health Monitor shutting down");

    Ok(())
}
