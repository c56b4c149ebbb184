//! Runtime unit capabilities shared by both launch strategies

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use crate::deploy::bundle::DeployMode;
use crate::deploy::ports::PortLease;
use crate::deploy::stager::StagedProject;
use crate::errors::ShipyardError;

const LOG_MAX_LINES: usize = 2000;

/// A running container or process.
///
/// The handle owns the start/stop lifecycle of the unit; the OS resources
/// behind it belong to the kernel or the container engine.
#[async_trait]
pub trait RuntimeHandle: Send + Sync {
    /// Short human readable reference (pid, container name)
    fn describe(&self) -> String;

    /// Whether the unit is still running
    async fn is_alive(&self) -> bool;

    /// Stop the unit, force-killing it once `grace` elapses.
    ///
    /// Stopping an already stopped unit is a no-op.
    async fn stop(&self, grace: Duration) -> Result<(), ShipyardError>;

    /// Last `tail` lines of captured output
    async fn logs(&self, tail: usize) -> Result<String, ShipyardError>;

    /// Start the unit again after it died
    async fn restart(&self) -> Result<(), ShipyardError>;

    /// Remove artifacts that outlive the unit itself (built images)
    async fn cleanup(&self) -> Result<(), ShipyardError> {
        Ok(())
    }
}

/// Starts a staged project as a supervised runtime unit
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Launch `project` bound to the leased port.
    ///
    /// Implementations call [`PortLease::release_bind`] immediately before
    /// the unit starts listening.
    async fn launch(
        &self,
        id: &str,
        project: &StagedProject,
        lease: &mut PortLease,
    ) -> Result<Arc<dyn RuntimeHandle>, ShipyardError>;
}

/// The launch strategy for each deployment mode
#[derive(Clone)]
pub struct Launchers {
    pub subprocess: Arc<dyn Launcher>,
    pub container: Arc<dyn Launcher>,
}

impl Launchers {
    pub fn for_mode(&self, mode: DeployMode) -> Arc<dyn Launcher> {
        match mode {
            DeployMode::Subprocess => self.subprocess.clone(),
            DeployMode::Container => self.container.clone(),
        }
    }
}

/// Bounded in-memory capture of a unit's stdout and stderr
#[derive(Debug, Default)]
pub struct LogBuffer {
    lines: VecDeque<String>,
}

impl LogBuffer {
    pub fn push_line(&mut self, line: String) {
        self.lines.push_back(line);
        while self.lines.len() > LOG_MAX_LINES {
            self.lines.pop_front();
        }
    }

    pub fn tail(&self, n: usize) -> String {
        let start = self.lines.len().saturating_sub(n);
        self.lines
            .iter()
            .skip(start)
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

pub type SharedLogs = Arc<Mutex<LogBuffer>>;

/// Copy lines from `reader` into `logs` until EOF
pub fn pump_lines<R>(reader: R, logs: SharedLogs, prefix: &'static str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            logs.lock()
                .unwrap_or_else(|e| e.into_inner())
                .push_line(format!("{prefix}{line}"));
        }
    });
}
