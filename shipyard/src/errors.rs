//! Error types for the deployment manager

use std::fmt;

use http::StatusCode;
use thiserror::Error;

/// Which half of a launch failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchStage {
    /// Image build (containerized mode)
    Build,

    /// Container run or process spawn
    Start,
}

impl fmt::Display for LaunchStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LaunchStage::Build => write!(f, "build"),
            LaunchStage::Start => write!(f, "start"),
        }
    }
}

/// Main error type for shipyard
#[derive(Error, Debug)]
pub enum ShipyardError {
    #[error("Invalid bundle: {0}")]
    BundleInvalid(String),

    #[error("Dependency install failed: {message}")]
    DependencyInstallFailed { message: String, logs: String },

    #[error("Launch failed during {stage}: {message}")]
    LaunchFailed {
        stage: LaunchStage,
        message: String,
        logs: String,
    },

    #[error("Application did not become ready within {timeout_secs}s")]
    ReadinessTimeout { timeout_secs: u64, logs: String },

    #[error("Application exited before becoming ready: {logs}")]
    CrashedEarly { logs: String },

    #[error("Tunnel unavailable: {0}")]
    TunnelUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Logs unavailable: {0}")]
    LogsUnavailable(String),

    #[error("No free port available: {0}")]
    PortUnavailable(String),

    #[error("Shutting down, deployment aborted")]
    ShuttingDown,

    #[error("Deployment {0} was torn down while provisioning")]
    Cancelled(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Archive error: {0}")]
    ZipError(#[from] zip::result::ZipError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ShipyardError {
    /// Whether the caller may retry the same request unchanged
    pub fn is_retryable(&self) -> bool {
        matches!(self, ShipyardError::PortUnavailable(_))
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            ShipyardError::BundleInvalid(_) => "bundle_invalid",
            ShipyardError::DependencyInstallFailed { .. } => "dependency_install_failed",
            ShipyardError::LaunchFailed { .. } => "launch_failed",
            ShipyardError::ReadinessTimeout { .. } => "readiness_timeout",
            ShipyardError::CrashedEarly { .. } => "crashed_early",
            ShipyardError::TunnelUnavailable(_) => "tunnel_unavailable",
            ShipyardError::NotFound(_) => "not_found",
            ShipyardError::LogsUnavailable(_) => "logs_unavailable",
            ShipyardError::PortUnavailable(_) => "port_unavailable",
            ShipyardError::ShuttingDown => "shutting_down",
            ShipyardError::Cancelled(_) => "cancelled",
            ShipyardError::IoError(_) => "io_error",
            ShipyardError::JsonError(_) => "json_error",
            ShipyardError::HttpError(_) => "http_error",
            ShipyardError::ZipError(_) => "bundle_invalid",
            ShipyardError::ConfigError(_) => "config_error",
            ShipyardError::ServerError(_) => "server_error",
            ShipyardError::ShutdownError(_) => "shutdown_error",
            ShipyardError::Internal(_) => "internal_error",
        }
    }

    /// HTTP status used when the error crosses the API boundary
    pub fn status_code(&self) -> StatusCode {
        match self {
            ShipyardError::BundleInvalid(_) | ShipyardError::ZipError(_) => StatusCode::BAD_REQUEST,
            ShipyardError::DependencyInstallFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            ShipyardError::NotFound(_) => StatusCode::NOT_FOUND,
            ShipyardError::LogsUnavailable(_) | ShipyardError::Cancelled(_) => StatusCode::CONFLICT,
            ShipyardError::TunnelUnavailable(_) => StatusCode::BAD_GATEWAY,
            ShipyardError::ReadinessTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ShipyardError::PortUnavailable(_) | ShipyardError::ShuttingDown => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Captured build/start/application output, if the error carries any
    pub fn logs(&self) -> Option<&str> {
        match self {
            ShipyardError::DependencyInstallFailed { logs, .. }
            | ShipyardError::LaunchFailed { logs, .. }
            | ShipyardError::ReadinessTimeout { logs, .. }
            | ShipyardError::CrashedEarly { logs } => Some(logs.as_str()),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for ShipyardError {
    fn from(err: anyhow::Error) -> Self {
        ShipyardError::Internal(err.to_string())
    }
}
