//! TCP port allocation

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::sync::Mutex;

use tracing::{debug, warn};

use crate::errors::ShipyardError;
use crate::utils::{calc_exp_backoff, CooldownOptions};

/// A port handed to one deployment.
///
/// Until [`PortLease::release_bind`] is called the port is held open by a
/// test bind, so no other process can take it between allocation and the
/// moment the runtime unit starts listening.
#[derive(Debug)]
pub struct PortLease {
    port: u16,
    reservation: Option<TcpListener>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether the test bind is still held
    pub fn is_bound(&self) -> bool {
        self.reservation.is_some()
    }

    /// Drop the test bind right before the real listener starts
    pub fn release_bind(&mut self) {
        if self.reservation.take().is_some() {
            debug!("Released reservation bind on port {}", self.port);
        }
    }
}

/// Hands out unused ports and remembers which ones are leased
pub struct PortAllocator {
    host: IpAddr,
    leased: Mutex<HashSet<u16>>,
    max_attempts: u32,
    cooldown: CooldownOptions,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::with_host(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    pub fn with_host(host: IpAddr) -> Self {
        Self {
            host,
            leased: Mutex::new(HashSet::new()),
            max_attempts: 8,
            cooldown: CooldownOptions::default(),
        }
    }

    /// Obtain a port that no active deployment holds.
    ///
    /// The OS picks the number (bind to port 0). A number that is still
    /// leased to another deployment is thrown back and the bind retried with
    /// backoff; running out of attempts is a retryable
    /// [`ShipyardError::PortUnavailable`].
    pub async fn allocate(&self) -> Result<PortLease, ShipyardError> {
        let mut last_error = String::from("every candidate port was already leased");

        for attempt in 0..self.max_attempts {
            match TcpListener::bind(SocketAddr::new(self.host, 0)) {
                Ok(listener) => {
                    let port = listener.local_addr()?.port();
                    let fresh = {
                        let mut leased = self.leased.lock().unwrap_or_else(|e| e.into_inner());
                        leased.insert(port)
                    };
                    if fresh {
                        debug!("Allocated port {}", port);
                        return Ok(PortLease {
                            port,
                            reservation: Some(listener),
                        });
                    }
                    debug!("Port {} is still leased, retrying", port);
                }
                Err(e) => {
                    warn!("Port allocation attempt {} failed: {}", attempt + 1, e);
                    last_error = e.to_string();
                }
            }
            tokio::time::sleep(calc_exp_backoff(&self.cooldown, attempt)).await;
        }

        Err(ShipyardError::PortUnavailable(last_error))
    }

    /// Return a port to the pool. Unknown ports are ignored.
    pub fn release(&self, port: u16) {
        let removed = self
            .leased
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&port);
        if removed {
            debug!("Released port {}", port);
        }
    }

    pub fn is_leased(&self, port: u16) -> bool {
        self.leased
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&port)
    }

    pub fn leased_count(&self) -> usize {
        self.leased.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new()
    }
}
