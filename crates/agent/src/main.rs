//! Power Agent - closed-loop battery optimization daemon
//!
//! Samples the local device, applies revertible power optimizations and
//! serves health, readiness, metrics and state over HTTP. All applied
//! optimizations are reverted on shutdown.

use anyhow::{Context, Result};
use power_agent::{api, config::AgentConfig};
use power_agent_lib::{
    collector::ProcfsMetricsSource,
    executor::{ActionExecutor, TargetRegistry},
    Controller, HealthRegistry, OptimizerConfig,
};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!(version = AGENT_VERSION, "Starting power-agent");

    let agent_config = AgentConfig::load()?;
    let optimizer_config = OptimizerConfig::load_or_create(&agent_config.config_path);
    info!(
        node_name = %agent_config.node_name,
        config_path = %agent_config.config_path.display(),
        mode = %optimizer_config.optimization_mode,
        "Agent configured"
    );

    let target = optimizer_config.target_application.clone();
    let source = Arc::new(ProcfsMetricsSource::with_roots(
        &agent_config.procfs_root,
        &agent_config.sysfs_root,
        target.clone(),
    ));
    let registry = TargetRegistry::new();
    let executor = ActionExecutor::for_host(
        &agent_config.sysfs_root,
        &agent_config.procfs_root,
        registry.clone(),
        target,
    );
    let health_registry = HealthRegistry::new();

    let controller = Arc::new(
        Controller::builder(optimizer_config, source)
            .executor(executor)
            .registry(registry)
            .health(health_registry.clone())
            .node_name(&agent_config.node_name)
            .build(),
    );
    controller
        .start()
        .await
        .context("failed to start controller")?;

    let app_state = Arc::new(api::AppState::new(health_registry, controller.clone()));
    let api_handle = tokio::spawn(api::serve(agent_config.api_port, app_state));

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    let reverted = controller.stop().await;
    info!(reverted = reverted.len(), "Reverted active optimizations");
    api_handle.abort();

    Ok(())
}
