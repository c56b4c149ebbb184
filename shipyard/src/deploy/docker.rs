//! Containerized launch strategy, driven through the docker CLI

use std::path::Path;
use std::process::{Output, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::deploy::ports::PortLease;
use crate::deploy::runtime::{Launcher, RuntimeHandle};
use crate::deploy::stager::StagedProject;
use crate::errors::{LaunchStage, ShipyardError};
use crate::filesys::file::File;
use crate::utils::{short_id, tail_lines};

/// Containerized mode options
#[derive(Debug, Clone)]
pub struct ContainerOptions {
    /// Docker CLI binary
    pub docker_bin: String,

    /// Port the application listens on inside the container
    pub internal_port: u16,

    /// Environment variable carrying the internal port
    pub port_env: String,

    pub image_prefix: String,
    pub container_prefix: String,

    /// Base image of generated build descriptors
    pub base_image: String,

    /// Dependency manifest copied into generated images
    pub manifest_name: String,

    /// Entry command of generated images; `{entry}` and `{port}` are substituted
    pub run_command: Vec<String>,

    /// Upper bound for `docker build`
    pub build_timeout: Duration,
}

impl Default for ContainerOptions {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            internal_port: 8080,
            port_env: "PORT".to_string(),
            image_prefix: "shipyard-app".to_string(),
            container_prefix: "shipyard".to_string(),
            base_image: "python:3.11-slim".to_string(),
            manifest_name: "requirements.txt".to_string(),
            run_command: [
                "streamlit",
                "run",
                "{entry}",
                "--server.port",
                "{port}",
                "--server.address",
                "0.0.0.0",
                "--server.headless",
                "true",
            ]
            .map(String::from)
            .to_vec(),
            build_timeout: Duration::from_secs(600),
        }
    }
}

/// Build a Dockerfile for a project that did not ship one
pub fn generate_dockerfile(options: &ContainerOptions, entry: &str, has_manifest: bool) -> String {
    let cmd: Vec<String> = options
        .run_command
        .iter()
        .map(|arg| {
            arg.replace("{entry}", entry)
                .replace("{port}", &options.internal_port.to_string())
        })
        .collect();
    // JSON array form, so arguments are never re-split by a shell
    let cmd = serde_json::to_string(&cmd).unwrap_or_else(|_| "[]".to_string());

    let mut out = format!("FROM {}\n\nWORKDIR /app\n\n", options.base_image);
    if has_manifest {
        out.push_str(&format!(
            "COPY {m} .\nRUN pip install --no-cache-dir -r {m}\n\n",
            m = options.manifest_name
        ));
    }
    out.push_str(&format!(
        "COPY . .\n\nENV {env}={port}\nEXPOSE {port}\n\nCMD {cmd}\n",
        env = options.port_env,
        port = options.internal_port,
    ));
    out
}

/// Builds an image per deployment and runs it
pub struct ContainerLauncher {
    options: ContainerOptions,
}

impl ContainerLauncher {
    pub fn new(options: ContainerOptions) -> Self {
        Self { options }
    }

    async fn build_image(&self, project_dir: &Path, image: &str) -> Result<(), ShipyardError> {
        info!("Building Docker image: {}", image);
        let build = Command::new(&self.options.docker_bin)
            .args(["build", "--rm", "--force-rm", "-t", image, "."])
            .current_dir(project_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.options.build_timeout, build).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ShipyardError::LaunchFailed {
                    stage: LaunchStage::Build,
                    message: format!("failed to run docker build: {e}"),
                    logs: String::new(),
                })
            }
            Err(_) => {
                return Err(ShipyardError::LaunchFailed {
                    stage: LaunchStage::Build,
                    message: format!(
                        "docker build did not finish within {}s",
                        self.options.build_timeout.as_secs()
                    ),
                    logs: String::new(),
                })
            }
        };

        if !output.status.success() {
            return Err(ShipyardError::LaunchFailed {
                stage: LaunchStage::Build,
                message: format!("docker build failed for {image}"),
                logs: tail_lines(&combined(&output), 100),
            });
        }

        info!("Successfully built image: {}", image);
        Ok(())
    }
}

#[async_trait]
impl Launcher for ContainerLauncher {
    async fn launch(
        &self,
        id: &str,
        project: &StagedProject,
        lease: &mut PortLease,
    ) -> Result<Arc<dyn RuntimeHandle>, ShipyardError> {
        let dir = project.dir.path();
        let dockerfile = File::new(dir.join("Dockerfile"));
        if !dockerfile.exists().await {
            let has_manifest = dir.join(&self.options.manifest_name).is_file();
            let contents = generate_dockerfile(&self.options, &project.entry, has_manifest);
            dockerfile.write_string(&contents).await?;
            debug!("Generated Dockerfile for {}", id);
        }

        let image = format!("{}-{}", self.options.image_prefix, short_id(id));
        let name = format!("{}-{}", self.options.container_prefix, short_id(id));
        self.build_image(dir, &image).await?;

        let handle = ContainerHandle {
            docker_bin: self.options.docker_bin.clone(),
            name: name.clone(),
            image: image.clone(),
            stopped: AtomicBool::new(false),
        };

        let publish = format!("{}:{}", lease.port(), self.options.internal_port);
        let env = format!("{}={}", self.options.port_env, self.options.internal_port);
        lease.release_bind();

        let run = Command::new(&self.options.docker_bin)
            .args(["run", "-d", "--name", &name, "-p", &publish, "-e", &env, &image])
            .stdin(Stdio::null())
            .output()
            .await;

        let failure = match run {
            Ok(output) if output.status.success() => None,
            Ok(output) => Some((
                format!("docker run failed for {image}"),
                tail_lines(&combined(&output), 100),
            )),
            Err(e) => Some((format!("failed to run docker run: {e}"), String::new())),
        };

        if let Some((message, logs)) = failure {
            // The image (and a created-but-dead container) would otherwise leak
            let _ = handle.stop(Duration::from_secs(1)).await;
            let _ = handle.cleanup().await;
            return Err(ShipyardError::LaunchFailed {
                stage: LaunchStage::Start,
                message,
                logs,
            });
        }

        info!(deployment_id = %id, port = lease.port(), "Started container {}", name);
        Ok(Arc::new(handle))
    }
}

/// Handle to a named container
pub struct ContainerHandle {
    docker_bin: String,
    name: String,
    image: String,
    stopped: AtomicBool,
}

impl ContainerHandle {
    async fn docker(&self, args: &[&str]) -> Result<Output, ShipyardError> {
        Ok(Command::new(&self.docker_bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?)
    }
}

#[async_trait]
impl RuntimeHandle for ContainerHandle {
    fn describe(&self) -> String {
        format!("container {}", self.name)
    }

    async fn is_alive(&self) -> bool {
        match self
            .docker(&["inspect", "-f", "{{.State.Running}}", &self.name])
            .await
        {
            Ok(output) if output.status.success() => {
                String::from_utf8_lossy(&output.stdout).trim() == "true"
            }
            _ => false,
        }
    }

    async fn stop(&self, grace: Duration) -> Result<(), ShipyardError> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let secs = grace.as_secs().max(1).to_string();
        let stop = self.docker(&["stop", "-t", &secs, &self.name]).await?;
        if !stop.status.success() && !is_missing(&stop) {
            warn!("docker stop {} failed: {}", self.name, combined(&stop).trim());
        }

        let rm = self.docker(&["rm", "-f", &self.name]).await?;
        if !rm.status.success() && !is_missing(&rm) {
            return Err(ShipyardError::Internal(format!(
                "failed to remove container {}: {}",
                self.name,
                combined(&rm).trim()
            )));
        }
        info!("Stopped container {}", self.name);
        Ok(())
    }

    async fn logs(&self, tail: usize) -> Result<String, ShipyardError> {
        let output = self
            .docker(&["logs", "--tail", &tail.to_string(), &self.name])
            .await
            .map_err(|e| ShipyardError::LogsUnavailable(e.to_string()))?;
        if !output.status.success() {
            return Err(ShipyardError::LogsUnavailable(combined(&output).trim().to_string()));
        }
        Ok(combined(&output))
    }

    async fn restart(&self) -> Result<(), ShipyardError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(ShipyardError::LaunchFailed {
                stage: LaunchStage::Start,
                message: format!("container {} was stopped", self.name),
                logs: String::new(),
            });
        }
        let output = self.docker(&["start", &self.name]).await?;
        if !output.status.success() {
            return Err(ShipyardError::LaunchFailed {
                stage: LaunchStage::Start,
                message: format!("docker start {} failed", self.name),
                logs: combined(&output),
            });
        }
        info!("Restarted container {}", self.name);
        Ok(())
    }

    async fn cleanup(&self) -> Result<(), ShipyardError> {
        let output = self.docker(&["rmi", "-f", &self.image]).await?;
        if !output.status.success() && !is_missing(&output) {
            return Err(ShipyardError::Internal(format!(
                "failed to remove image {}: {}",
                self.image,
                combined(&output).trim()
            )));
        }
        info!("Removed image {}", self.image);
        Ok(())
    }
}

fn combined(output: &Output) -> String {
    format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

fn is_missing(output: &Output) -> bool {
    String::from_utf8_lossy(&output.stderr)
        .to_lowercase()
        .contains("no such")
}
