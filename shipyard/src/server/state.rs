//! Server state

use std::sync::Arc;
use std::time::Instant;

use crate::deploy::manager::DeploymentManager;

/// Server state shared across handlers
pub struct ServerState {
    pub manager: Arc<DeploymentManager>,
    pub started_at: Instant,
}

impl ServerState {
    pub fn new(manager: Arc<DeploymentManager>) -> Self {
        Self {
            manager,
            started_at: Instant::now(),
        }
    }
}
