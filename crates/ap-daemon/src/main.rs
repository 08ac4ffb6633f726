//! agent-pipeline daemon: polls the project board and drives each tracked
//! issue through its agent stages.

use std::sync::Arc;

use anyhow::{Context, Result};
use ap_core::config::{Config, ConfigHandle, FileSource};
use ap_integrations::github::GitHubClient;
use ap_telemetry::logging::{init_logging, LogFormat};
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();

    let path = Config::config_path();
    let config = Arc::new(
        ConfigHandle::new(FileSource::default_location())
            .with_context(|| format!("failed to load config from {}", path.display()))?,
    );
    let settings = config.current();
    init_logging(
        "ap-daemon",
        &settings.config.general.log_level,
        LogFormat::parse(&settings.config.general.log_format),
    );
    info!(
        project = %settings.config.general.project_name,
        config = %path.display(),
        "agent pipeline daemon starting"
    );

    let client = GitHubClient::from_integrations(&settings.config.integrations)
        .context("failed to create GitHub client")?;
    let daemon = ap_daemon::daemon::Daemon::new(config.clone(), Arc::new(client));

    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("ctrl-c received, initiating shutdown");
        shutdown.trigger();
    });

    daemon.run().await
}
