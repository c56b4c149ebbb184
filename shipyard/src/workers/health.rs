//! Health monitor for one running deployment

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::deploy::fsm::{DeploymentStatus, StatusEvent};
use crate::deploy::manager::DeploymentManager;

/// Health monitor options
#[derive(Debug, Clone)]
pub struct Options {
    /// Time between liveness checks
    pub interval: Duration,

    /// Restart attempts over the deployment's lifetime before it is torn down
    pub max_restarts: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            max_restarts: 3,
        }
    }
}

/// What one tick decided
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tick {
    Healthy,
    Restarted,
    RestartFailed,
    TornDown,
    Gone,
}

/// Run the monitor until the deployment goes away or shutdown is signalled
pub async fn run<S, F>(
    options: &Options,
    deployment_id: &str,
    manager: &DeploymentManager,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    debug!("Health monitor starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                debug!("Health monitor shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        match check(options, deployment_id, manager).await {
            Tick::Gone | Tick::TornDown => {
                debug!("Health monitor exiting");
                return;
            }
            _ => {}
        }
    }
}

/// One liveness check, restarting or tearing down as needed
pub async fn check(options: &Options, deployment_id: &str, manager: &DeploymentManager) -> Tick {
    let registry = manager.registry();
    let Some(record) = registry.get(deployment_id) else {
        return Tick::Gone;
    };
    if registry.is_tearing_down(deployment_id) {
        return Tick::Gone;
    }
    let Some(runtime) = registry.runtime(deployment_id) else {
        return Tick::Gone;
    };

    if runtime.is_alive().await {
        if record.status == DeploymentStatus::Degraded {
            info!("{} is back up", runtime.describe());
            let _ = registry.apply_if_live(deployment_id, StatusEvent::Restarted);
            return Tick::Restarted;
        }
        return Tick::Healthy;
    }

    if record.restart_count >= options.max_restarts {
        let reason = format!(
            "{} died and {} restart attempts are used up",
            runtime.describe(),
            options.max_restarts
        );
        error!("{}", reason);
        manager
            .teardown_with(deployment_id, StatusEvent::RestartsExhausted(reason))
            .await;
        return Tick::TornDown;
    }

    let attempt = match registry.record_restart(deployment_id) {
        Ok(attempt) => attempt,
        Err(_) => return Tick::Gone,
    };
    warn!(
        "{} is not running, restart attempt {}/{}",
        runtime.describe(),
        attempt,
        options.max_restarts
    );

    match runtime.restart().await {
        Ok(()) => {
            info!("Restarted {}", runtime.describe());
            match registry.apply_if_live(deployment_id, StatusEvent::Restarted) {
                Ok(_) => Tick::Restarted,
                Err(_) => Tick::Gone,
            }
        }
        Err(e) => {
            warn!("Restart failed: {}", e);
            match registry.apply_if_live(deployment_id, StatusEvent::RestartFailed(e.to_string())) {
                Ok(_) => Tick::RestartFailed,
                Err(_) => Tick::Gone,
            }
        }
    }
}
