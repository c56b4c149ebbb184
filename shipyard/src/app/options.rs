//! Application configuration options

use std::time::Duration;

use crate::deploy::docker::ContainerOptions;
use crate::deploy::manager::ManagerOptions;
use crate::deploy::process::SubprocessOptions;
use crate::deploy::tunnel::NgrokOptions;
use crate::storage::layout::StorageLayout;
use crate::storage::settings::{Settings, TunnelKind};

/// Main application options
#[derive(Debug, Clone)]
pub struct AppOptions {
    /// Lifecycle configuration
    pub lifecycle: LifecycleOptions,

    /// Storage layout paths
    pub layout: StorageLayout,

    /// Server configuration
    pub server: ServerOptions,

    /// Orchestration
    pub manager: ManagerOptions,

    /// Tunnel provider
    pub tunnel: TunnelOptions,

    /// Subprocess mode
    pub subprocess: SubprocessOptions,

    /// Containerized mode
    pub container: ContainerOptions,
}

impl Default for AppOptions {
    fn default() -> Self {
        Self {
            lifecycle: LifecycleOptions::default(),
            layout: StorageLayout::default(),
            server: ServerOptions::default(),
            manager: ManagerOptions::default(),
            tunnel: TunnelOptions::Local {
                host: "127.0.0.1".to_string(),
            },
            subprocess: SubprocessOptions::default(),
            container: ContainerOptions::default(),
        }
    }
}

impl AppOptions {
    pub fn from_settings(settings: &Settings, layout: StorageLayout) -> Self {
        let tunnel = match settings.tunnel.provider {
            TunnelKind::Local => TunnelOptions::Local {
                host: settings.tunnel.local_host.clone(),
            },
            TunnelKind::Ngrok => TunnelOptions::Ngrok(settings.tunnel.ngrok()),
        };

        Self {
            lifecycle: LifecycleOptions::default(),
            layout,
            server: ServerOptions {
                host: settings.api.host.clone(),
                port: settings.api.port,
            },
            manager: ManagerOptions {
                default_mode: settings.default_mode,
                readiness: settings.readiness(),
                health: settings.health(),
                stop_grace: settings.stop_grace(),
                entry_rules: settings.subprocess.entry_rules(),
            },
            tunnel,
            subprocess: settings.subprocess.options(),
            container: settings.container.options(&settings.subprocess),
        }
    }
}

/// Which tunnel provider to build
#[derive(Debug, Clone)]
pub enum TunnelOptions {
    Local { host: String },
    Ngrok(NgrokOptions),
}

/// Lifecycle options for the daemon
#[derive(Debug, Clone)]
pub struct LifecycleOptions {
    /// How long in-flight deployments get to finish or abort
    pub drain_timeout: Duration,

    /// Maximum delay for graceful shutdown
    pub max_shutdown_delay: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(30),
            max_shutdown_delay: Duration::from_secs(90),
        }
    }
}

/// Local HTTP server options
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8001,
        }
    }
}
