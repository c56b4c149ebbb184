//! Readiness probing

use std::time::Duration;

use reqwest::Client;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::deploy::runtime::RuntimeHandle;
use crate::errors::ShipyardError;

/// Lines of output attached to crash and timeout outcomes
const LOG_TAIL: usize = 50;

/// Grace for output pumps to catch up after the unit exited
const CRASH_LOG_SETTLE: Duration = Duration::from_millis(200);

/// Result of waiting for a unit to come up
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// The application answered with a success status
    Ready,

    /// Still alive, never answered
    TimedOut { logs: String },

    /// Exited before ever answering
    CrashedEarly { logs: String },
}

impl Readiness {
    /// Turn a non-ready outcome into its error
    pub fn into_result(self, timeout: Duration) -> Result<(), ShipyardError> {
        match self {
            Readiness::Ready => Ok(()),
            Readiness::TimedOut { logs } => Err(ShipyardError::ReadinessTimeout {
                timeout_secs: timeout.as_secs(),
                logs,
            }),
            Readiness::CrashedEarly { logs } => Err(ShipyardError::CrashedEarly { logs }),
        }
    }
}

/// Probe options
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// Give up after this long
    pub timeout: Duration,

    /// Delay between polls
    pub interval: Duration,

    /// Host the application is reached on
    pub host: String,

    /// Path requested on each poll
    pub path: String,

    /// Per-request timeout
    pub request_timeout: Duration,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            interval: Duration::from_secs(1),
            host: "127.0.0.1".to_string(),
            path: "/".to_string(),
            request_timeout: Duration::from_secs(5),
        }
    }
}

/// Polls a freshly launched unit until it answers
pub struct ReadinessProber {
    client: Client,
    options: ProbeOptions,
}

impl ReadinessProber {
    pub fn new(options: ProbeOptions) -> Result<Self, ShipyardError> {
        let client = Client::builder()
            .timeout(options.request_timeout)
            .no_proxy()
            .build()?;
        Ok(Self { client, options })
    }

    pub fn options(&self) -> &ProbeOptions {
        &self.options
    }

    /// Wait until the unit on `port` answers, exits, or the timeout elapses.
    ///
    /// Liveness is checked before every request, so a unit that dies early
    /// short-circuits the wait and is reported as crashed rather than as a
    /// timeout.
    pub async fn wait_ready(&self, handle: &dyn RuntimeHandle, port: u16) -> Readiness {
        let url = format!("http://{}:{}{}", self.options.host, port, self.options.path);
        let deadline = Instant::now() + self.options.timeout;

        loop {
            if !handle.is_alive().await {
                return self.crashed(handle).await;
            }

            match self.client.get(&url).send().await {
                Ok(response) if response.status().is_success() => {
                    info!("Application is ready and responding on {}", url);
                    return Readiness::Ready;
                }
                Ok(response) => {
                    debug!("Not ready yet: {} answered {}", url, response.status());
                }
                Err(e) => {
                    debug!("Not ready yet: {}", e);
                }
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(self.options.interval.min(deadline - now)).await;
        }

        if !handle.is_alive().await {
            return self.crashed(handle).await;
        }

        warn!(
            "{} not ready after {}s",
            handle.describe(),
            self.options.timeout.as_secs()
        );
        Readiness::TimedOut {
            logs: handle.logs(LOG_TAIL).await.unwrap_or_default(),
        }
    }

    async fn crashed(&self, handle: &dyn RuntimeHandle) -> Readiness {
        tokio::time::sleep(CRASH_LOG_SETTLE).await;
        let logs = handle.logs(LOG_TAIL).await.unwrap_or_default();
        warn!("{} exited before becoming ready", handle.describe());
        Readiness::CrashedEarly { logs }
    }
}
