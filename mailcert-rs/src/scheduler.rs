//! Renewal scheduling
//!
//! One pass inspects every managed domain, collects the ones inside the
//! renewal window and renews them together, so a pass opens at most one
//! mediation window per contiguous run of mail-port methods.

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use std::future::Future;
use std::path::PathBuf;
use tracing::{error, info, warn};

use crate::challenge::{ChallengeSelector, MediationWindow, MethodAttempt};
use crate::deploy::{DeploymentHook, DeploymentReport};
use crate::error::Result;
use crate::lock::RunLock;
use crate::store::{CertificateState, CertificateStore};
use crate::types::{ChallengeMethod, Domain, IssuanceMethod};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewalOutcome {
    Success,
    ExhaustedFailure,
}

/// One renewal run, kept for logging and exit status only
#[derive(Debug, Clone)]
pub struct RenewalAttempt {
    pub domains: Vec<String>,
    /// Method that succeeded, if any
    pub method: Option<ChallengeMethod>,
    pub outcome: RenewalOutcome,
    pub attempts: Vec<MethodAttempt>,
    pub started_at: DateTime<Utc>,
    pub port_released_at: Option<DateTime<Utc>>,
    pub port_reacquired_at: Option<DateTime<Utc>>,
    pub windows: Vec<MediationWindow>,
    pub deployment: Option<DeploymentReport>,
}

/// Result of one scheduler pass
#[derive(Debug, Clone)]
pub enum RunReport {
    /// Another run held the lock
    Skipped,
    NothingToDo,
    Renewed(RenewalAttempt),
    Failed(RenewalAttempt),
}

impl RunReport {
    pub fn attempt(&self) -> Option<&RenewalAttempt> {
        match self {
            RunReport::Renewed(attempt) | RunReport::Failed(attempt) => Some(attempt),
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, RunReport::Failed(_))
    }
}

/// Domains whose certificate expires within `window` of `now`.
///
/// Missing, partial or unreadable material counts as due.
pub fn due_domains(
    states: &[(Domain, CertificateState)],
    now: DateTime<Utc>,
    window: Duration,
) -> Vec<Domain> {
    let mut due = Vec::new();

    for (domain, state) in states {
        match state {
            CertificateState::Valid(record) => {
                if record.is_due(now, window) {
                    info!(
                        domain = %domain,
                        not_after = %record.not_after,
                        days_remaining = record.days_remaining(now),
                        "Certificate inside renewal window"
                    );
                    due.push(domain.clone());
                }
            }
            other => {
                warn!(
                    domain = %domain,
                    state = %other.describe(),
                    "No usable certificate, treating as due"
                );
                due.push(domain.clone());
            }
        }
    }

    due
}

/// Time until the next pass: the interval plus up to `jitter`
pub fn next_delay(interval: std::time::Duration, jitter: std::time::Duration) -> std::time::Duration {
    let extra = rand::thread_rng().gen_range(0..=jitter.as_secs());
    interval + std::time::Duration::from_secs(extra)
}

pub struct RenewalScheduler {
    store: CertificateStore,
    selector: ChallengeSelector,
    deploy: DeploymentHook,
    domains: Vec<Domain>,
    window: Duration,
    lock_path: PathBuf,
}

impl RenewalScheduler {
    pub fn new(
        store: CertificateStore,
        selector: ChallengeSelector,
        deploy: DeploymentHook,
        domains: Vec<Domain>,
        window: Duration,
        lock_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            selector,
            deploy,
            domains,
            window,
            lock_path: lock_path.into(),
        }
    }

    pub fn domains(&self) -> &[Domain] {
        &self.domains
    }

    /// Current store state of every managed domain
    pub fn inspect(&self) -> Vec<(Domain, CertificateState)> {
        self.domains
            .iter()
            .map(|domain| (domain.clone(), self.store.inspect(&domain.name)))
            .collect()
    }

    /// One pass. Mediation failures are returned as errors; exhausting the
    /// challenge chain is a `Failed` report.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<RunReport> {
        let _lock = match RunLock::try_acquire(&self.lock_path)? {
            Some(lock) => lock,
            None => {
                info!(lock = ?self.lock_path, "Another renewal run is in progress, skipping");
                return Ok(RunReport::Skipped);
            }
        };

        let due = due_domains(&self.inspect(), now, self.window);
        if due.is_empty() {
            info!(
                domains = self.domains.len(),
                window_days = self.window.num_days(),
                "No certificate due for renewal"
            );
            return Ok(RunReport::NothingToDo);
        }

        let names: Vec<String> = due.iter().map(|d| d.name.clone()).collect();
        info!(domains = ?names, "Starting renewal run");

        let started_at = Utc::now();
        let selection = self.selector.select(&due).await?;

        let mut attempt = RenewalAttempt {
            domains: names,
            method: selection.succeeded_with(),
            outcome: if selection.is_success() {
                RenewalOutcome::Success
            } else {
                RenewalOutcome::ExhaustedFailure
            },
            started_at,
            port_released_at: selection.windows.first().map(|w| w.released_at),
            port_reacquired_at: selection.windows.last().map(|w| w.reacquired_at),
            windows: selection.windows,
            attempts: selection.attempts,
            deployment: None,
        };

        if attempt.outcome == RenewalOutcome::ExhaustedFailure {
            error!(
                domains = ?attempt.domains,
                attempts = attempt.attempts.len(),
                "Renewal failed, every challenge method exhausted"
            );
            return Ok(RunReport::Failed(attempt));
        }

        if let Some(method) = attempt.method {
            for domain in &due {
                if let Some(record) = self.store.inspect(&domain.name).record() {
                    let record = record.issued_by(IssuanceMethod::Acme(method));
                    info!(
                        domain = %domain,
                        not_after = %record.not_after,
                        method = %record.method,
                        "Certificate renewed"
                    );
                }
            }
        }

        attempt.deployment = Some(self.deploy.apply(&selection.artifacts).await?);
        info!(
            domains = ?attempt.domains,
            method = ?attempt.method,
            "Renewal run complete"
        );
        Ok(RunReport::Renewed(attempt))
    }

    /// Periodic passes until `shutdown` resolves. Only a mail daemon left
    /// down ends the loop with an error.
    pub async fn run_forever<S>(
        &self,
        interval: std::time::Duration,
        jitter: std::time::Duration,
        shutdown: S,
    ) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        loop {
            match self.run_once(Utc::now()).await {
                Ok(RunReport::Failed(attempt)) => {
                    warn!(domains = ?attempt.domains, "Renewal pass failed, will retry next pass");
                }
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => error!(error = %e, "Renewal pass aborted"),
            }

            let delay = next_delay(interval, jitter);
            info!(next_check_secs = delay.as_secs(), "Next renewal check scheduled");

            tokio::select! {
                _ = &mut shutdown => {
                    info!("Renewal loop stopping");
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}
