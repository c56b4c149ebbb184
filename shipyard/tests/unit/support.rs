//! Shared fixtures: an in-process fake application and manager builders

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{routing::get, Router};
use tempfile::TempDir;
use tokio::task::JoinHandle;

use shipyard::deploy::bundle::{Bundle, BundleFile};
use shipyard::deploy::manager::{DeploymentManager, ManagerOptions};
use shipyard::deploy::ports::{PortAllocator, PortLease};
use shipyard::deploy::probe::ProbeOptions;
use shipyard::deploy::registry::Registry;
use shipyard::deploy::runtime::{Launcher, Launchers, RuntimeHandle};
use shipyard::deploy::stager::StagedProject;
use shipyard::deploy::tunnel::{LocalTunnel, TunnelProvider};
use shipyard::errors::{LaunchStage, ShipyardError};
use shipyard::filesys::dir::Dir;
use shipyard::workers::health;

pub const GREETING: &str = "hello from the fake app";

/// A web application served from inside the test process
pub struct FakeApp {
    port: u16,
    server: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    alive: AtomicBool,
    stopped: AtomicBool,
    allow_restart: bool,
    restarts: AtomicUsize,
}

impl FakeApp {
    pub async fn start(port: u16, allow_restart: bool) -> Result<Arc<Self>, ShipyardError> {
        let app = Arc::new(Self {
            port,
            server: tokio::sync::Mutex::new(None),
            alive: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            allow_restart,
            restarts: AtomicUsize::new(0),
        });
        app.serve().await?;
        Ok(app)
    }

    async fn serve(&self) -> Result<(), ShipyardError> {
        let listener = tokio::net::TcpListener::bind(("0.0.0.0", self.port)).await?;
        let router = Router::new().route("/", get(|| async { GREETING }));
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        *self.server.lock().await = Some(handle);
        self.alive.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Simulate the application dying on its own
    pub async fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
        if let Some(handle) = self.server.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RuntimeHandle for FakeApp {
    fn describe(&self) -> String {
        format!("fake app on port {}", self.port)
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn stop(&self, _grace: Duration) -> Result<(), ShipyardError> {
        self.stopped.store(true, Ordering::SeqCst);
        self.kill().await;
        Ok(())
    }

    async fn logs(&self, _tail: usize) -> Result<String, ShipyardError> {
        Ok(format!("serving on {}\n", self.port))
    }

    async fn restart(&self) -> Result<(), ShipyardError> {
        if self.is_stopped() || !self.allow_restart {
            return Err(ShipyardError::LaunchFailed {
                stage: LaunchStage::Start,
                message: "refusing to restart".to_string(),
                logs: String::new(),
            });
        }
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.serve().await
    }
}

/// Launches [`FakeApp`]s and remembers them
#[derive(Default)]
pub struct FakeLauncher {
    pub allow_restart: bool,
    apps: Mutex<Vec<Arc<FakeApp>>>,
}

impl FakeLauncher {
    pub fn restartable() -> Self {
        Self {
            allow_restart: true,
            ..Default::default()
        }
    }

    pub fn apps(&self) -> Vec<Arc<FakeApp>> {
        self.apps.lock().unwrap().clone()
    }
}

#[async_trait]
impl Launcher for FakeLauncher {
    async fn launch(
        &self,
        _id: &str,
        _project: &StagedProject,
        lease: &mut PortLease,
    ) -> Result<Arc<dyn RuntimeHandle>, ShipyardError> {
        lease.release_bind();
        let app = FakeApp::start(lease.port(), self.allow_restart).await?;
        self.apps.lock().unwrap().push(app.clone());
        Ok(app)
    }
}

/// Tunnel provider that is always down
pub struct BrokenTunnel;

#[async_trait]
impl TunnelProvider for BrokenTunnel {
    fn name(&self) -> &'static str {
        "broken"
    }

    async fn open(&self, port: u16) -> Result<String, ShipyardError> {
        Err(ShipyardError::TunnelUnavailable(format!(
            "no tunnel for port {port}"
        )))
    }

    async fn close(&self, _public_url: &str) -> Result<(), ShipyardError> {
        Ok(())
    }
}

/// A manager plus the pieces tests inspect
pub struct Harness {
    pub manager: Arc<DeploymentManager>,
    pub ports: Arc<PortAllocator>,
    pub staging: TempDir,
}

impl Harness {
    pub fn staged_dirs(&self) -> usize {
        count_entries(self.staging.path())
    }
}

pub fn fast_options() -> ManagerOptions {
    ManagerOptions {
        readiness: ProbeOptions {
            timeout: Duration::from_secs(10),
            interval: Duration::from_millis(50),
            ..Default::default()
        },
        health: health::Options {
            interval: Duration::from_millis(100),
            max_restarts: 2,
        },
        stop_grace: Duration::from_secs(2),
        ..Default::default()
    }
}

pub fn harness_with(
    options: ManagerOptions,
    launcher: Arc<dyn Launcher>,
    tunnel: Arc<dyn TunnelProvider>,
) -> Harness {
    let staging = tempfile::tempdir().unwrap();
    let ports = Arc::new(PortAllocator::new());
    let launchers = Launchers {
        subprocess: launcher.clone(),
        container: launcher,
    };
    let manager = DeploymentManager::new(
        options,
        Arc::new(Registry::new()),
        ports.clone(),
        Dir::new(staging.path()),
        launchers,
        tunnel,
    )
    .unwrap();
    Harness {
        manager,
        ports,
        staging,
    }
}

pub fn harness(launcher: Arc<dyn Launcher>) -> Harness {
    harness_with(fast_options(), launcher, Arc::new(LocalTunnel::default()))
}

pub fn python_bundle() -> Bundle {
    Bundle::new(vec![
        BundleFile::new("app.py", "import streamlit as st\nst.write('hi')\n"),
        BundleFile::new("utils/helpers.py", "def helper():\n    return 1\n"),
    ])
}

pub fn count_entries(path: &Path) -> usize {
    std::fs::read_dir(path).map(|rd| rd.count()).unwrap_or(0)
}

/// Poll `check` every 20ms until it holds or `timeout` passes
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
