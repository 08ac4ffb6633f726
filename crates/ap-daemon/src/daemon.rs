use std::sync::Arc;

use anyhow::{Context, Result};
use ap_core::config::ConfigHandle;
use ap_harness::shutdown::ShutdownSignal;
use ap_integrations::gateway::IssueTracker;
use tracing::{error, info};

use crate::api::{api_router, ApiState};
use crate::orchestrator::Orchestrator;
use crate::polling::PollingLoop;

/// The agent pipeline daemon.
///
/// Runs the polling loop and, when enabled, the HTTP status API. Shuts down
/// gracefully when the `ShutdownSignal` is triggered (e.g. via ctrl-c): the
/// in-flight tick completes before the loop exits.
pub struct Daemon {
    config: Arc<ConfigHandle>,
    polling: Arc<PollingLoop>,
    shutdown: ShutdownSignal,
}

impl Daemon {
    pub fn new(config: Arc<ConfigHandle>, tracker: Arc<dyn IssueTracker>) -> Self {
        let orchestrator = Arc::new(Orchestrator::new(tracker, config.clone()));
        Self {
            config,
            polling: Arc::new(PollingLoop::new(orchestrator)),
            shutdown: ShutdownSignal::new(),
        }
    }

    /// Returns a handle that can be used to trigger shutdown from another task.
    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn polling(&self) -> &Arc<PollingLoop> {
        &self.polling
    }

    /// Run until shutdown.
    pub async fn run(&self) -> Result<()> {
        let settings = self.config.current();
        let api_handle = if settings.config.daemon.api_enabled {
            let bind_addr = settings.config.daemon.bind_addr();
            let listener = tokio::net::TcpListener::bind(&bind_addr)
                .await
                .with_context(|| format!("failed to bind API server to {bind_addr}"))?;
            Some(self.spawn_api(listener)?)
        } else {
            None
        };

        self.run_polling().await;

        if let Some(handle) = api_handle {
            if let Err(e) = handle.await {
                error!(error = %e, "API server task failed");
            }
        }
        info!("daemon stopped");
        Ok(())
    }

    /// Serve the API on `listener` until shutdown.
    pub fn spawn_api(&self, listener: tokio::net::TcpListener) -> Result<tokio::task::JoinHandle<()>> {
        let addr = listener.local_addr()?;
        let router = api_router(Arc::new(ApiState::new(self.polling.clone())));
        let mut stop = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, router)
                .with_graceful_shutdown(async move { stop.recv().await })
                .await;
            if let Err(e) = served {
                error!(error = %e, "API server error");
            }
        });
        info!(%addr, "API server listening");
        Ok(handle)
    }

    /// Tick immediately, then once per polling interval. A shutdown waits
    /// for the running tick to finish.
    pub async fn run_polling(&self) {
        let mut stop = self.shutdown.subscribe();
        info!(
            interval_secs = self.config.current().config.polling.interval_secs,
            "polling loop starting"
        );
        loop {
            let report = self.polling.tick().await;
            if !report.errors.is_empty() {
                info!(tick = report.tick, errors = report.errors.len(), "tick finished with errors");
            }
            if self.shutdown.is_shutting_down() {
                break;
            }
            let interval = self.config.current().config.polling.interval();
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = stop.recv() => break,
            }
        }
        info!("polling loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ap_core::config::Config;
    use ap_integrations::fake::FakeTracker;
    use std::time::Duration;

    #[tokio::test]
    async fn polling_stops_after_shutdown() {
        let mut config = Config::default();
        config.daemon.api_enabled = false;
        let handle = Arc::new(ConfigHandle::from_config(config).unwrap());
        let daemon = Daemon::new(handle, Arc::new(FakeTracker::new()));

        let shutdown = daemon.shutdown_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown.trigger();
        });

        tokio::time::timeout(Duration::from_secs(5), daemon.run())
            .await
            .expect("daemon should stop")
            .unwrap();
        assert_eq!(daemon.polling().status().await.ticks, 1);
    }
}
