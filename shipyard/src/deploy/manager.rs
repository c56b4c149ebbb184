//! Deployment orchestration and teardown
//!
//! Provisioning runs stage → port → launch → readiness → tunnel → running,
//! strictly in that order. Any failure after the record is registered routes
//! through [`DeploymentManager::teardown`] before the error reaches the
//! caller.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{error, info, info_span, warn, Instrument};

use crate::deploy::bundle::{Bundle, DeployMode};
use crate::deploy::fsm::{DeploymentStatus, StatusEvent};
use crate::deploy::ports::PortAllocator;
use crate::deploy::probe::{ProbeOptions, ReadinessProber};
use crate::deploy::registry::{DeploymentRecord, Registry};
use crate::deploy::runtime::{Launchers, RuntimeHandle};
use crate::deploy::stager::{EntryRules, Stager};
use crate::deploy::tunnel::TunnelProvider;
use crate::errors::ShipyardError;
use crate::filesys::dir::Dir;
use crate::models::deployment::{DeployResponse, UndeployResponse};
use crate::utils::{generate_uuid, short_id};
use crate::workers::health;

/// Manager options
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Mode used when a request does not name one
    pub default_mode: DeployMode,

    /// Readiness probing
    pub readiness: ProbeOptions,

    /// Health monitoring
    pub health: health::Options,

    /// Time a unit gets to exit before it is killed
    pub stop_grace: Duration,

    /// Entry file recognition
    pub entry_rules: EntryRules,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            default_mode: DeployMode::Subprocess,
            readiness: ProbeOptions::default(),
            health: health::Options::default(),
            stop_grace: Duration::from_secs(10),
            entry_rules: EntryRules::default(),
        }
    }
}

/// Counts provisioning flows that have not finished yet
#[derive(Default)]
struct InFlight {
    count: AtomicUsize,
    idle: Notify,
}

struct InFlightGuard(Arc<InFlight>);

impl InFlightGuard {
    fn enter(in_flight: &Arc<InFlight>) -> Self {
        in_flight.count.fetch_add(1, Ordering::SeqCst);
        Self(in_flight.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

/// Owns every deployment of this process
pub struct DeploymentManager {
    registry: Arc<Registry>,
    ports: Arc<PortAllocator>,
    stager: Stager,
    launchers: Launchers,
    prober: ReadinessProber,
    tunnel: Arc<dyn TunnelProvider>,
    options: ManagerOptions,
    shutdown_tx: watch::Sender<bool>,
    in_flight: Arc<InFlight>,
    monitors: Mutex<Vec<JoinHandle<()>>>,
}

impl DeploymentManager {
    pub fn new(
        options: ManagerOptions,
        registry: Arc<Registry>,
        ports: Arc<PortAllocator>,
        staging_root: Dir,
        launchers: Launchers,
        tunnel: Arc<dyn TunnelProvider>,
    ) -> Result<Arc<Self>, ShipyardError> {
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            registry,
            ports,
            stager: Stager::new(staging_root, options.entry_rules.clone()),
            launchers,
            prober: ReadinessProber::new(options.readiness.clone())?,
            tunnel,
            options,
            shutdown_tx,
            in_flight: Arc::new(InFlight::default()),
            monitors: Mutex::new(Vec::new()),
        }))
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn ports(&self) -> &Arc<PortAllocator> {
        &self.ports
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    pub fn tunnel_provider(&self) -> &'static str {
        self.tunnel.name()
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    fn ensure_open(&self) -> Result<(), ShipyardError> {
        if self.is_shutting_down() {
            return Err(ShipyardError::ShuttingDown);
        }
        Ok(())
    }

    /// Like `ensure_open`, but also fails once `id` has been claimed for teardown
    fn ensure_live(&self, id: &str) -> Result<(), ShipyardError> {
        self.ensure_open()?;
        if !self.registry.contains(id) || self.registry.is_tearing_down(id) {
            return Err(ShipyardError::Cancelled(id.to_string()));
        }
        Ok(())
    }

    async fn shutdown_requested(&self) {
        let mut rx = self.shutdown_tx.subscribe();
        let _ = rx.wait_for(|closing| *closing).await;
    }

    // ================================ DEPLOY ===================================== //

    /// Deploy a bundle and return once it is live behind its public URL.
    ///
    /// Provisioning runs on its own task: dropping the returned future (a
    /// disconnected client, say) never abandons a half-built deployment.
    pub async fn deploy(
        self: &Arc<Self>,
        bundle: Bundle,
        mode: Option<DeployMode>,
    ) -> Result<DeployResponse, ShipyardError> {
        self.ensure_open()?;
        let guard = InFlightGuard::enter(&self.in_flight);

        let mode = mode.unwrap_or(self.options.default_mode);
        let id = generate_uuid();
        let span = info_span!("deploy", deployment_id = %id, %mode);
        let this = self.clone();

        tokio::spawn(
            async move {
                let _guard = guard;
                this.provision(id, bundle, mode).await
            }
            .instrument(span),
        )
        .await
        .map_err(|e| ShipyardError::Internal(format!("provisioning task failed: {e}")))?
    }

    async fn provision(
        self: &Arc<Self>,
        id: String,
        bundle: Bundle,
        mode: DeployMode,
    ) -> Result<DeployResponse, ShipyardError> {
        info!("Deploying {} files", bundle.files().len());

        // Nothing exists yet, so nothing to tear down on failure
        let staged = self
            .stager
            .stage(&bundle, &format!("deploy_{}", short_id(&id)))
            .await?;

        let mut lease = match self.ensure_open() {
            Ok(()) => match self.ports.allocate().await {
                Ok(lease) => lease,
                Err(e) => {
                    discard_dir(&staged.dir).await;
                    return Err(e);
                }
            },
            Err(e) => {
                discard_dir(&staged.dir).await;
                return Err(e);
            }
        };
        let port = lease.port();

        let record = DeploymentRecord::provisioning(
            id.clone(),
            mode,
            staged.dir.path().to_path_buf(),
            port,
            bundle.digest(),
        );
        if let Err(e) = self.registry.insert(record) {
            discard_dir(&staged.dir).await;
            self.ports.release(port);
            return Err(e);
        }

        // From here on the record owns the directory and port
        let result: Result<DeploymentRecord, ShipyardError> = async {
            self.ensure_live(&id)?;
            let launcher = self.launchers.for_mode(mode);
            let runtime = launcher.launch(&id, &staged, &mut lease).await?;
            drop(lease);

            if let Err(e) = self.registry.attach_runtime(&id, runtime.clone()) {
                stop_orphan(runtime.as_ref(), self.options.stop_grace).await;
                self.ensure_live(&id)?;
                return Err(e);
            }

            self.ensure_live(&id)?;
            let readiness = tokio::select! {
                r = self.prober.wait_ready(runtime.as_ref(), port) => r,
                _ = self.shutdown_requested() => return Err(ShipyardError::ShuttingDown),
            };
            // An undeploy stops the unit under the prober; that is not a crash
            self.ensure_live(&id)?;
            readiness.into_result(self.options.readiness.timeout)?;

            let public_url = self.tunnel.open(port).await?;
            match self.registry.mark_running(&id, public_url.clone()) {
                Ok(record) => Ok(record),
                Err(e) => {
                    if let Err(close) = self.tunnel.close(&public_url).await {
                        warn!("Failed to close tunnel {}: {}", public_url, close);
                    }
                    self.ensure_live(&id)?;
                    Err(e)
                }
            }
        }
        .await;

        match result {
            Ok(record) => {
                self.spawn_monitor(&id);
                let public_url = record.public_url.clone().unwrap_or_default();
                info!(port, "Deployment is live at {}", public_url);
                Ok(DeployResponse {
                    id: record.id,
                    public_url,
                    port: record.port,
                    status: record.status,
                })
            }
            Err(e @ ShipyardError::Cancelled(_)) => {
                info!("Deployment cancelled by teardown");
                Err(e)
            }
            Err(e) => {
                error!("Deployment failed: {}", e);
                self.teardown_with(&id, StatusEvent::ProvisionFailed(e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    fn spawn_monitor(self: &Arc<Self>, id: &str) {
        let this = self.clone();
        let deployment_id = id.to_string();
        let options = self.options.health.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let span = info_span!("health", deployment_id = %id);

        let handle = tokio::spawn(
            async move {
                health::run(
                    &options,
                    &deployment_id,
                    this.as_ref(),
                    tokio::time::sleep,
                    Box::pin(async move {
                        let _ = shutdown_rx.wait_for(|closing| *closing).await;
                    }),
                )
                .await;
            }
            .instrument(span),
        );

        let mut monitors = self.monitors.lock().unwrap_or_else(|e| e.into_inner());
        monitors.retain(|h| !h.is_finished());
        monitors.push(handle);
    }

    // ============================== OPERATIONS ================================== //

    /// Tear a deployment down on request
    pub async fn undeploy(&self, id: &str) -> Result<UndeployResponse, ShipyardError> {
        if !self.registry.contains(id) {
            return Err(ShipyardError::NotFound(id.to_string()));
        }
        self.teardown(id).await?;
        Ok(UndeployResponse {
            id: id.to_string(),
            status: DeploymentStatus::Stopped,
        })
    }

    pub fn status(&self, id: &str) -> Result<DeploymentRecord, ShipyardError> {
        self.registry
            .get(id)
            .ok_or_else(|| ShipyardError::NotFound(id.to_string()))
    }

    pub fn list(&self) -> Vec<DeploymentRecord> {
        self.registry.list()
    }

    pub async fn logs(&self, id: &str, tail: usize) -> Result<String, ShipyardError> {
        if !self.registry.contains(id) {
            return Err(ShipyardError::NotFound(id.to_string()));
        }
        let runtime = self.registry.runtime(id).ok_or_else(|| {
            ShipyardError::LogsUnavailable(format!("deployment {id} has no runtime unit yet"))
        })?;
        runtime.logs(tail).await
    }

    // =============================== TEARDOWN =================================== //

    /// Idempotent teardown of `id`.
    ///
    /// Fails with `NotFound` only when no record exists. When another caller
    /// is already tearing the same record down this returns immediately.
    pub async fn teardown(&self, id: &str) -> Result<(), ShipyardError> {
        if self.teardown_with(id, StatusEvent::Stop).await {
            Ok(())
        } else if self.registry.contains(id) {
            Ok(())
        } else {
            Err(ShipyardError::NotFound(id.to_string()))
        }
    }

    /// Release everything `id` holds, then drop the record.
    ///
    /// Every step logs and continues on failure. Returns false if there was
    /// nothing to claim.
    pub(crate) async fn teardown_with(&self, id: &str, event: StatusEvent) -> bool {
        let Some(claim) = self.registry.claim_teardown(id) else {
            return false;
        };
        let record = claim.record;
        info!(deployment_id = %id, port = record.port, "Tearing down deployment");

        if let Some(runtime) = claim.runtime {
            if let Err(e) = runtime.stop(self.options.stop_grace).await {
                warn!(deployment_id = %id, "Failed to stop {}: {}", runtime.describe(), e);
            }
            if let Err(e) = runtime.cleanup().await {
                warn!(deployment_id = %id, "Failed to clean up {}: {}", runtime.describe(), e);
            }
        }

        if let Some(url) = &record.public_url {
            if let Err(e) = self.tunnel.close(url).await {
                warn!(deployment_id = %id, "Failed to close tunnel {}: {}", url, e);
            }
        }

        if let Err(e) = Dir::new(&record.work_dir).delete().await {
            warn!(
                deployment_id = %id,
                "Failed to remove {}: {}",
                record.work_dir.display(),
                e
            );
        }

        self.ports.release(record.port);

        match self.registry.apply(id, event) {
            Ok(rec) => info!(deployment_id = %id, "Deployment {}", rec.status),
            Err(e) => warn!(deployment_id = %id, "Final status not recorded: {}", e),
        }
        self.registry.remove(id);
        true
    }

    /// Drain, then tear down everything.
    ///
    /// New deployments are refused from the first line on. In-flight
    /// provisioning flows abort at their next step and clean up after
    /// themselves; once they are gone (or `drain_timeout` passes) every
    /// remaining record is torn down.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        info!("Shutting down deployment manager...");
        self.shutdown_tx.send_replace(true);

        if tokio::time::timeout(drain_timeout, self.wait_idle())
            .await
            .is_err()
        {
            warn!(
                "{} provisioning flows still running after {:?}",
                self.in_flight.count.load(Ordering::SeqCst),
                drain_timeout
            );
        }

        self.teardown_all().await;

        let monitors: Vec<_> = self
            .monitors
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in monitors {
            if let Err(e) = handle.await {
                warn!("Health monitor ended abnormally: {}", e);
            }
        }

        self.tunnel.shutdown().await;
        info!("Deployment manager shut down");
    }

    /// Tear down every record still registered
    pub async fn teardown_all(&self) {
        let ids = self.registry.ids();
        if ids.is_empty() {
            return;
        }
        info!("Cleaning up {} deployments", ids.len());
        futures::future::join_all(
            ids.iter()
                .map(|id| self.teardown_with(id, StatusEvent::Stop)),
        )
        .await;
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.in_flight.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight.count.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

async fn discard_dir(dir: &Dir) {
    if let Err(e) = dir.delete().await {
        warn!("Failed to remove {}: {}", dir.path().display(), e);
    }
}

async fn stop_orphan(runtime: &dyn RuntimeHandle, grace: Duration) {
    if let Err(e) = runtime.stop(grace).await {
        warn!("Failed to stop {}: {}", runtime.describe(), e);
    }
    if let Err(e) = runtime.cleanup().await {
        warn!("Failed to clean up {}: {}", runtime.describe(), e);
    }
}
