//! Deployment status state machine

use serde::{Deserialize, Serialize};

/// Deployment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    /// Staging, launching, probing or tunneling
    Provisioning,

    /// Live and reachable
    Running,

    /// The unit died and the last restart attempt failed
    Degraded,

    /// Torn down on request
    Stopped,

    /// Provisioning failed or restarts were exhausted
    Failed,
}

impl DeploymentStatus {
    /// Whether the deployment still holds its port and working directory
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            DeploymentStatus::Provisioning | DeploymentStatus::Running | DeploymentStatus::Degraded
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeploymentStatus::Provisioning => "provisioning",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Degraded => "degraded",
            DeploymentStatus::Stopped => "stopped",
            DeploymentStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Status event
#[derive(Debug, Clone)]
pub enum StatusEvent {
    /// Launch, readiness and tunnel all succeeded
    Provisioned,

    /// A provisioning step failed
    ProvisionFailed(String),

    /// The health monitor brought a dead unit back
    Restarted,

    /// The health monitor's restart attempt failed
    RestartFailed(String),

    /// The restart bound was reached
    RestartsExhausted(String),

    /// Explicit undeploy or process shutdown
    Stop,
}

/// Apply `event` to `status`, returning the next status
pub fn transition(
    status: DeploymentStatus,
    event: &StatusEvent,
) -> Result<DeploymentStatus, String> {
    use DeploymentStatus::*;

    let next = match (status, event) {
        (Provisioning, StatusEvent::Provisioned) => Running,
        (Provisioning, StatusEvent::ProvisionFailed(_)) => Failed,

        (Running | Degraded, StatusEvent::Restarted) => Running,
        (Running | Degraded, StatusEvent::RestartFailed(_)) => Degraded,
        (Running | Degraded, StatusEvent::RestartsExhausted(_)) => Failed,

        (Provisioning | Running | Degraded, StatusEvent::Stop) => Stopped,

        (state, event) => {
            return Err(format!("Invalid transition: {:?} -> {:?}", state, event));
        }
    };

    Ok(next)
}

impl StatusEvent {
    /// Failure reason carried by the event, if any
    pub fn reason(&self) -> Option<&str> {
        match self {
            StatusEvent::ProvisionFailed(reason)
            | StatusEvent::RestartFailed(reason)
            | StatusEvent::RestartsExhausted(reason) => Some(reason),
            _ => None,
        }
    }
}
