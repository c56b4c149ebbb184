//! Subprocess launch strategy

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::deploy::ports::PortLease;
use crate::deploy::runtime::{pump_lines, Launcher, RuntimeHandle, SharedLogs};
use crate::deploy::stager::StagedProject;
use crate::errors::{LaunchStage, ShipyardError};
use crate::utils::tail_lines;

/// Subprocess mode options
#[derive(Debug, Clone)]
pub struct SubprocessOptions {
    /// Dependency manifest looked up in the project root
    pub manifest_name: String,

    /// Install command; `{manifest}` is replaced with the manifest path
    pub install_command: Vec<String>,

    /// Upper bound for the install step
    pub install_timeout: Duration,

    /// Run command; `{entry}` and `{port}` are substituted
    pub run_command: Vec<String>,

    /// Environment variable carrying the port
    pub port_env: String,
}

impl Default for SubprocessOptions {
    fn default() -> Self {
        Self {
            manifest_name: "requirements.txt".to_string(),
            install_command: ["pip", "install", "-r", "{manifest}"]
                .map(String::from)
                .to_vec(),
            install_timeout: Duration::from_secs(300),
            run_command: [
                "streamlit",
                "run",
                "{entry}",
                "--server.port",
                "{port}",
                "--server.headless",
                "true",
                "--browser.serverAddress",
                "0.0.0.0",
                "--browser.gatherUsageStats",
                "false",
            ]
            .map(String::from)
            .to_vec(),
            port_env: "PORT".to_string(),
        }
    }
}

/// Launches staged projects as child processes
pub struct SubprocessLauncher {
    options: SubprocessOptions,
}

impl SubprocessLauncher {
    pub fn new(options: SubprocessOptions) -> Self {
        Self { options }
    }

    /// Install declared dependencies, if the project declares any
    pub async fn install_dependencies(&self, project_dir: &Path) -> Result<(), ShipyardError> {
        let manifest = project_dir.join(&self.options.manifest_name);
        if !manifest.is_file() {
            debug!("No {} in {}, skipping install", self.options.manifest_name, project_dir.display());
            return Ok(());
        }

        let manifest_str = manifest.to_string_lossy();
        let argv = substitute(
            &self.options.install_command,
            &[("{manifest}", manifest_str.as_ref())],
        );
        let (program, args) = argv.split_first().ok_or_else(|| {
            ShipyardError::ConfigError("install command is empty".to_string())
        })?;

        info!("Installing dependencies from {}", manifest.display());
        let output = Command::new(program)
            .args(args)
            .current_dir(project_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.options.install_timeout, output).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ShipyardError::DependencyInstallFailed {
                    message: format!("failed to run {program}: {e}"),
                    logs: String::new(),
                })
            }
            Err(_) => {
                return Err(ShipyardError::DependencyInstallFailed {
                    message: format!(
                        "install did not finish within {}s",
                        self.options.install_timeout.as_secs()
                    ),
                    logs: String::new(),
                })
            }
        };

        if !output.status.success() {
            let logs = format!(
                "{}{}",
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr)
            );
            return Err(ShipyardError::DependencyInstallFailed {
                message: format!("{program} exited with {}", output.status),
                logs: tail_lines(&logs, 100),
            });
        }

        info!("Dependencies installed from {}", manifest.display());
        Ok(())
    }
}

#[async_trait]
impl Launcher for SubprocessLauncher {
    async fn launch(
        &self,
        id: &str,
        project: &StagedProject,
        lease: &mut PortLease,
    ) -> Result<Arc<dyn RuntimeHandle>, ShipyardError> {
        self.install_dependencies(project.dir.path()).await?;

        let entry_path = project.dir.path().join(&project.entry);
        let port = lease.port();
        let entry_str = entry_path.to_string_lossy();
        let port_str = port.to_string();
        let argv = substitute(
            &self.options.run_command,
            &[("{entry}", entry_str.as_ref()), ("{port}", port_str.as_str())],
        );
        if argv.is_empty() {
            return Err(ShipyardError::ConfigError("run command is empty".to_string()));
        }

        let spec = ProcessSpec {
            argv,
            cwd: project.dir.path().to_path_buf(),
            env: vec![(self.options.port_env.clone(), port.to_string())],
        };

        let logs = SharedLogs::default();
        lease.release_bind();
        let child = spec.spawn(&logs).map_err(|e| ShipyardError::LaunchFailed {
            stage: LaunchStage::Start,
            message: format!("failed to spawn {}: {e}", spec.argv[0]),
            logs: String::new(),
        })?;

        info!(
            deployment_id = %id,
            port,
            "Started {} as pid {:?}",
            project.entry,
            child.id()
        );

        Ok(Arc::new(ProcessHandle {
            spec,
            logs,
            state: Mutex::new(ProcState {
                pgid: child.id(),
                child: Some(child),
                stopped: false,
            }),
        }))
    }
}

fn substitute(template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            vars.iter()
                .fold(arg.clone(), |acc, (key, value)| acc.replace(key, value))
        })
        .collect()
}

/// Everything needed to (re)spawn the same process
#[derive(Debug, Clone)]
struct ProcessSpec {
    argv: Vec<String>,
    cwd: PathBuf,
    env: Vec<(String, String)>,
}

impl ProcessSpec {
    fn spawn(&self, logs: &SharedLogs) -> std::io::Result<Child> {
        let mut cmd = Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..])
            .current_dir(&self.cwd)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group with pgid == pid, so stop() reaches children the entry spawns
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn()?;
        if let Some(out) = child.stdout.take() {
            pump_lines(out, logs.clone(), "");
        }
        if let Some(err) = child.stderr.take() {
            pump_lines(err, logs.clone(), "");
        }
        Ok(child)
    }
}

struct ProcState {
    child: Option<Child>,
    /// Group of the current child; outlives the leader until reaped by stop/restart
    pgid: Option<u32>,
    /// Set by stop(); a stopped handle never respawns
    stopped: bool,
}

/// Handle to a spawned child process
pub struct ProcessHandle {
    spec: ProcessSpec,
    logs: SharedLogs,
    state: Mutex<ProcState>,
}

impl ProcessHandle {
    fn log_line(&self, line: String) {
        self.logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_line(line);
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(pgid) = state.pgid.take() {
            signal_group(pgid, GroupSignal::Kill);
        }
    }
}

#[async_trait]
impl RuntimeHandle for ProcessHandle {
    fn describe(&self) -> String {
        format!("process `{}`", self.spec.argv.join(" "))
    }

    async fn is_alive(&self) -> bool {
        let mut state = self.state.lock().await;
        let alive = match state.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        };
        // Forget a fully exited group so its id is never signalled after reuse
        if !alive && state.pgid.is_some_and(|pgid| !group_alive(pgid)) {
            state.pgid = None;
        }
        alive
    }

    async fn stop(&self, grace: Duration) -> Result<(), ShipyardError> {
        let mut state = self.state.lock().await;
        state.stopped = true;
        let pgid = state.pgid.take();
        let child = state.child.take();
        if pgid.is_none() && child.is_none() {
            return Ok(());
        }

        // The leader may already be gone while the rest of its group still runs
        if let Some(pgid) = pgid {
            signal_group(pgid, GroupSignal::Term);
        }
        let deadline = Instant::now() + grace;

        if let Some(mut child) = child {
            match tokio::time::timeout_at(deadline, child.wait()).await {
                Ok(Ok(status)) => debug!("Process exited with {}", status),
                Ok(Err(e)) => warn!("Error waiting for process: {}", e),
                Err(_) => {
                    warn!("Process did not exit within {:?}, killing", grace);
                    if let Some(pgid) = pgid {
                        signal_group(pgid, GroupSignal::Kill);
                    }
                    child.kill().await?;
                }
            }
        }

        if let Some(pgid) = pgid {
            reap_group(pgid, deadline).await;
        }
        Ok(())
    }

    async fn logs(&self, tail: usize) -> Result<String, ShipyardError> {
        Ok(self
            .logs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .tail(tail))
    }

    async fn restart(&self) -> Result<(), ShipyardError> {
        let mut state = self.state.lock().await;
        if state.stopped {
            return Err(ShipyardError::LaunchFailed {
                stage: LaunchStage::Start,
                message: "process was stopped and cannot be restarted".to_string(),
                logs: String::new(),
            });
        }
        if let Some(child) = state.child.as_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                return Ok(());
            }
        }

        // Leftovers of the old group would still hold the port
        if let Some(pgid) = state.pgid.take() {
            signal_group(pgid, GroupSignal::Kill);
            reap_group(pgid, Instant::now() + RESPAWN_REAP_TIMEOUT).await;
        }

        self.log_line("--- restarting ---".to_string());
        let child = self.spec.spawn(&self.logs).map_err(|e| ShipyardError::LaunchFailed {
            stage: LaunchStage::Start,
            message: format!("failed to respawn {}: {e}", self.spec.argv[0]),
            logs: String::new(),
        })?;
        info!("Restarted {} as pid {:?}", self.spec.argv[0], child.id());
        state.pgid = child.id();
        state.child = Some(child);
        Ok(())
    }
}

/// Upper bound on waiting for a killed group to disappear before a respawn
const RESPAWN_REAP_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Term,
    Kill,
}

/// Wait for every member of `pgid` to exit, killing stragglers at `deadline`
async fn reap_group(pgid: u32, deadline: Instant) {
    while group_alive(pgid) {
        if Instant::now() >= deadline {
            warn!("Process group {} outlived its grace period, killing", pgid);
            signal_group(pgid, GroupSignal::Kill);
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: GroupSignal) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = match signal {
        GroupSignal::Term => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(pgid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!("Failed to send {} to process group {}: {}", signal, pgid, e),
    }
}

#[cfg(unix)]
fn group_alive(pgid: u32) -> bool {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    killpg(Pid::from_raw(pgid as i32), None).is_ok()
}

#[cfg(not(unix))]
fn signal_group(_pgid: u32, _signal: GroupSignal) {}

#[cfg(not(unix))]
fn group_alive(_pgid: u32) -> bool {
    false
}
