//! Application state management

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::app::options::{AppOptions, TunnelOptions};
use crate::deploy::docker::ContainerLauncher;
use crate::deploy::manager::DeploymentManager;
use crate::deploy::ports::PortAllocator;
use crate::deploy::process::SubprocessLauncher;
use crate::deploy::registry::Registry;
use crate::deploy::runtime::Launchers;
use crate::deploy::tunnel::{LocalTunnel, NgrokTunnel, TunnelProvider};
use crate::errors::ShipyardError;

/// Main application state
pub struct AppState {
    pub manager: Arc<DeploymentManager>,
    drain_timeout: Duration,
}

impl AppState {
    /// Initialize application state
    pub async fn init(options: &AppOptions) -> Result<Self, ShipyardError> {
        info!("Initializing application state...");

        options.layout.setup().await?;

        let tunnel: Arc<dyn TunnelProvider> = match &options.tunnel {
            TunnelOptions::Local { host } => Arc::new(LocalTunnel::new(host.clone())),
            TunnelOptions::Ngrok(ngrok) => Arc::new(NgrokTunnel::new(ngrok.clone())?),
        };
        info!("Publishing deployments through the {} tunnel provider", tunnel.name());

        let launchers = Launchers {
            subprocess: Arc::new(SubprocessLauncher::new(options.subprocess.clone())),
            container: Arc::new(ContainerLauncher::new(options.container.clone())),
        };

        let manager = DeploymentManager::new(
            options.manager.clone(),
            Arc::new(Registry::new()),
            Arc::new(PortAllocator::new()),
            options.layout.deployments_dir(),
            launchers,
            tunnel,
        )?;

        Ok(Self {
            manager,
            drain_timeout: options.lifecycle.drain_timeout,
        })
    }

    /// Refuse new work, then release every deployment
    pub async fn shutdown(&self) -> Result<(), ShipyardError> {
        info!("Shutting down application state...");
        self.manager.shutdown(self.drain_timeout).await;
        Ok(())
    }
}
