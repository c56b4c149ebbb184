//! Registry of deployments currently held by this process
//!
//! The map is guarded by one mutex. Every read-modify-write (insert, status
//! change, removal) happens inside a single short critical section; slow I/O
//! always runs before or after it, never while the lock is held.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::deploy::bundle::DeployMode;
use crate::deploy::fsm::{transition, DeploymentStatus, StatusEvent};
use crate::deploy::runtime::RuntimeHandle;
use crate::errors::ShipyardError;

/// Snapshot of one deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentRecord {
    pub id: String,
    pub mode: DeployMode,
    pub work_dir: PathBuf,
    pub port: u16,
    pub public_url: Option<String>,
    pub status: DeploymentStatus,
    pub created_at: DateTime<Utc>,
    pub bundle_digest: String,
    pub restart_count: u32,
    pub last_error: Option<String>,

    /// Description of the runtime unit, once launched
    pub runtime: Option<String>,
}

impl DeploymentRecord {
    /// A fresh record in `provisioning`
    pub fn provisioning(
        id: String,
        mode: DeployMode,
        work_dir: PathBuf,
        port: u16,
        bundle_digest: String,
    ) -> Self {
        Self {
            id,
            mode,
            work_dir,
            port,
            public_url: None,
            status: DeploymentStatus::Provisioning,
            created_at: Utc::now(),
            bundle_digest,
            restart_count: 0,
            last_error: None,
            runtime: None,
        }
    }
}

struct Entry {
    record: DeploymentRecord,
    runtime: Option<Arc<dyn RuntimeHandle>>,
    tearing_down: bool,
}

/// What a teardown needs, handed out exactly once per record
pub struct TeardownClaim {
    pub record: DeploymentRecord,
    pub runtime: Option<Arc<dyn RuntimeHandle>>,
}

/// Concurrency-safe map from deployment id to record
#[derive(Default)]
pub struct Registry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert a new record.
    ///
    /// Fails if the id exists, or if an active record already holds the port.
    pub fn insert(&self, record: DeploymentRecord) -> Result<(), ShipyardError> {
        let mut entries = self.lock();
        if entries.contains_key(&record.id) {
            return Err(ShipyardError::Internal(format!(
                "deployment {} already registered",
                record.id
            )));
        }
        if let Some(holder) = entries
            .values()
            .find(|e| e.record.port == record.port && e.record.status.is_active())
        {
            return Err(ShipyardError::Internal(format!(
                "port {} already held by deployment {}",
                record.port, holder.record.id
            )));
        }
        debug!(deployment_id = %record.id, port = record.port, "Registered deployment");
        entries.insert(
            record.id.clone(),
            Entry {
                record,
                runtime: None,
                tearing_down: false,
            },
        );
        Ok(())
    }

    /// Attach the launched runtime unit to a provisioning record
    pub fn attach_runtime(
        &self,
        id: &str,
        runtime: Arc<dyn RuntimeHandle>,
    ) -> Result<(), ShipyardError> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(id)
            .filter(|e| !e.tearing_down)
            .ok_or_else(|| ShipyardError::NotFound(id.to_string()))?;
        entry.record.runtime = Some(runtime.describe());
        entry.runtime = Some(runtime);
        Ok(())
    }

    /// Publish the tunnel URL and move to `running` in one step.
    ///
    /// The URL can only be set once, and only on a record whose runtime is
    /// attached, so no reader ever sees `running` without both.
    pub fn mark_running(&self, id: &str, public_url: String) -> Result<DeploymentRecord, ShipyardError> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(id)
            .filter(|e| !e.tearing_down)
            .ok_or_else(|| ShipyardError::NotFound(id.to_string()))?;

        if entry.runtime.is_none() {
            return Err(ShipyardError::Internal(format!(
                "deployment {id} has no runtime attached"
            )));
        }
        if entry.record.public_url.is_some() {
            return Err(ShipyardError::Internal(format!(
                "deployment {id} already has a public url"
            )));
        }

        let next = transition(entry.record.status, &StatusEvent::Provisioned)
            .map_err(ShipyardError::Internal)?;
        entry.record.public_url = Some(public_url);
        entry.record.status = next;
        Ok(entry.record.clone())
    }

    /// Apply a status event; failure reasons land in `last_error`
    pub fn apply(&self, id: &str, event: StatusEvent) -> Result<DeploymentRecord, ShipyardError> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| ShipyardError::NotFound(id.to_string()))?;

        let next = transition(entry.record.status, &event).map_err(ShipyardError::Internal)?;
        if let Some(reason) = event.reason() {
            entry.record.last_error = Some(reason.to_string());
        }
        debug!(deployment_id = %id, "Status {} -> {}", entry.record.status, next);
        entry.record.status = next;
        Ok(entry.record.clone())
    }

    /// Like [`Registry::apply`], but leaves a record under teardown alone
    pub fn apply_if_live(
        &self,
        id: &str,
        event: StatusEvent,
    ) -> Result<DeploymentRecord, ShipyardError> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(id)
            .filter(|e| !e.tearing_down)
            .ok_or_else(|| ShipyardError::NotFound(id.to_string()))?;

        let next = transition(entry.record.status, &event).map_err(ShipyardError::Internal)?;
        if let Some(reason) = event.reason() {
            entry.record.last_error = Some(reason.to_string());
        }
        entry.record.status = next;
        Ok(entry.record.clone())
    }

    /// Count one restart attempt, returning the new total
    pub fn record_restart(&self, id: &str) -> Result<u32, ShipyardError> {
        let mut entries = self.lock();
        let entry = entries
            .get_mut(id)
            .filter(|e| !e.tearing_down)
            .ok_or_else(|| ShipyardError::NotFound(id.to_string()))?;
        entry.record.restart_count += 1;
        Ok(entry.record.restart_count)
    }

    pub fn get(&self, id: &str) -> Option<DeploymentRecord> {
        self.lock().get(id).map(|e| e.record.clone())
    }

    pub fn runtime(&self, id: &str) -> Option<Arc<dyn RuntimeHandle>> {
        self.lock().get(id).and_then(|e| e.runtime.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// Whether a teardown has been claimed for `id`
    pub fn is_tearing_down(&self, id: &str) -> bool {
        self.lock().get(id).is_some_and(|e| e.tearing_down)
    }

    /// All records, oldest first
    pub fn list(&self) -> Vec<DeploymentRecord> {
        let mut records: Vec<_> = self.lock().values().map(|e| e.record.clone()).collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        records
    }

    pub fn ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Claim the right to tear `id` down.
    ///
    /// Returns `None` if the record is gone or another caller already holds
    /// the claim.
    pub fn claim_teardown(&self, id: &str) -> Option<TeardownClaim> {
        let mut entries = self.lock();
        let entry = entries.get_mut(id)?;
        if entry.tearing_down {
            return None;
        }
        entry.tearing_down = true;
        Some(TeardownClaim {
            record: entry.record.clone(),
            runtime: entry.runtime.clone(),
        })
    }

    pub fn remove(&self, id: &str) -> Option<DeploymentRecord> {
        let removed = self.lock().remove(id).map(|e| e.record);
        if removed.is_some() {
            debug!(deployment_id = %id, "Removed deployment");
        }
        removed
    }
}
