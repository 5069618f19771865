//! Port mediation
//!
//! The mail daemon owns the submission/SMTPS ports. TLS-ALPN-01 validation
//! needs one of them, so the daemon is stopped for the duration of the
//! challenge and started again afterwards, whatever the challenge did.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::daemon::MailDaemon;
use crate::error::{CertError, Result};
use crate::probe::PortProbe;

/// Bounded polling used while waiting for ports and for the daemon
#[derive(Debug, Clone, Copy)]
pub struct PortWait {
    pub attempts: u32,
    pub backoff: Duration,
}

impl Default for PortWait {
    fn default() -> Self {
        Self {
            attempts: 10,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Value produced inside a mediation window, with the window's bounds
#[derive(Debug, Clone)]
pub struct Mediated<T> {
    pub value: T,
    /// When the daemon was stopped
    pub released_at: DateTime<Utc>,
    /// When the daemon was confirmed running again
    pub reacquired_at: DateTime<Utc>,
}

/// Exclusive control of the mail ports while the daemon is down.
///
/// Dropping a lease without releasing it leaves the mediator flagged, so
/// [`PortMediator::recover`] can still bring the daemon back.
pub struct PortLease {
    open: Arc<AtomicBool>,
    ports: Vec<u16>,
    released: bool,
}

impl PortLease {
    fn release(mut self) {
        self.released = true;
        self.open.store(false, Ordering::SeqCst);
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        if !self.released {
            error!(
                ports = ?self.ports,
                "Port lease abandoned while mail daemon was suspended"
            );
        }
    }
}

/// Scoped stop/start of the mail daemon around port-binding operations
pub struct PortMediator {
    daemon: Arc<dyn MailDaemon>,
    probe: Arc<dyn PortProbe>,
    wait: PortWait,
    lease_open: Arc<AtomicBool>,
}

impl PortMediator {
    pub fn new(daemon: Arc<dyn MailDaemon>, probe: Arc<dyn PortProbe>, wait: PortWait) -> Self {
        Self {
            daemon,
            probe,
            wait,
            lease_open: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn daemon(&self) -> Arc<dyn MailDaemon> {
        self.daemon.clone()
    }

    /// Whether a lease is currently open (or was abandoned)
    pub fn is_lease_open(&self) -> bool {
        self.lease_open.load(Ordering::SeqCst)
    }

    fn acquire(&self, ports: &[u16]) -> Result<PortLease> {
        self.lease_open
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| CertError::LeaseHeld)?;

        Ok(PortLease {
            open: self.lease_open.clone(),
            ports: ports.to_vec(),
            released: false,
        })
    }

    /// Run `operation` with the mail daemon stopped.
    ///
    /// The daemon is started exactly once afterwards, whether the operation
    /// returned normally or panicked. A daemon that is not running after that
    /// single restart yields [`CertError::DaemonNotRestarted`].
    pub async fn with_port_suspended<T, F, Fut>(
        &self,
        ports: &[u16],
        operation: F,
    ) -> Result<Mediated<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let lease = self.acquire(ports)?;

        info!(ports = ?ports, "Suspending mail daemon");
        if let Err(e) = self.daemon.stop().await {
            warn!(error = %e, "Failed to stop mail daemon cleanly");
        }
        let released_at = Utc::now();

        if !self.wait_for_ports_free(ports).await {
            warn!(
                ports = ?ports,
                attempts = self.wait.attempts,
                "Ports still in use, proceeding anyway"
            );
        }

        let outcome = AssertUnwindSafe(async move { operation().await })
            .catch_unwind()
            .await;

        let restarted = self.restart().await;
        let reacquired_at = Utc::now();
        lease.release();

        match outcome {
            Err(panic) => {
                if let Err(e) = &restarted {
                    error!(error = %e, "Mail daemon down after panicked operation");
                }
                std::panic::resume_unwind(panic)
            }
            Ok(value) => {
                restarted?;
                info!(ports = ?ports, "Mail daemon resumed");
                Ok(Mediated {
                    value,
                    released_at,
                    reacquired_at,
                })
            }
        }
    }

    /// Restart the daemon if a lease was abandoned mid-window.
    ///
    /// Returns whether a restart was needed.
    pub async fn recover(&self) -> Result<bool> {
        if !self.is_lease_open() {
            return Ok(false);
        }

        warn!("Recovering mail daemon after interrupted mediation window");
        let result = self.restart().await;
        self.lease_open.store(false, Ordering::SeqCst);
        result.map(|_| true)
    }

    async fn wait_for_ports_free(&self, ports: &[u16]) -> bool {
        for attempt in 0..=self.wait.attempts {
            let mut busy = Vec::new();
            for port in ports {
                if self.probe.is_in_use(*port).await {
                    busy.push(*port);
                }
            }
            if busy.is_empty() {
                return true;
            }
            if attempt < self.wait.attempts {
                tokio::time::sleep(self.wait.backoff).await;
            }
        }
        false
    }

    /// One start attempt, then a bounded health check
    async fn restart(&self) -> Result<()> {
        if let Err(e) = self.daemon.start().await {
            warn!(error = %e, "Mail daemon start command failed");
        }

        for attempt in 0..=self.wait.attempts {
            if self.daemon.is_running().await {
                return Ok(());
            }
            if attempt < self.wait.attempts {
                tokio::time::sleep(self.wait.backoff).await;
            }
        }

        error!("Mail daemon is not running after restart, operator intervention required");
        Err(CertError::DaemonNotRestarted(format!(
            "not running after {} checks",
            self.wait.attempts + 1
        )))
    }
}
