//! Entry points used by the CLI
//!
//! Builds the store, mediator, selector, scheduler and deployment hook from
//! [`Settings`] and exposes one method per command.

use chrono::{DateTime, Utc};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::acme::{AcmeClient, Certbot};
use crate::challenge::ChallengeSelector;
use crate::config::Settings;
use crate::daemon::{MailDaemon, PostfixService};
use crate::deploy::{DeploymentHook, DeploymentReport};
use crate::error::{CertError, Result};
use crate::lock::RunLock;
use crate::mediator::{PortMediator, PortWait};
use crate::probe::{PortProbe, TcpPortProbe};
use crate::scheduler::{RenewalScheduler, RunReport};
use crate::store::{CertificatePaths, CertificateState, CertificateStore};
use crate::types::{CertificateArtifacts, Domain};

/// What container start-up did for each domain
#[derive(Debug, Clone, Default)]
pub struct BootstrapReport {
    pub reused: Vec<String>,
    pub issued: Vec<String>,
    pub self_signed: Vec<String>,
    pub deployment: Option<DeploymentReport>,
}

#[derive(Debug, Clone)]
pub struct DomainStatus {
    pub domain: Domain,
    pub state: CertificateState,
    pub due: bool,
}

impl DomainStatus {
    pub fn days_remaining(&self, now: DateTime<Utc>) -> Option<i64> {
        self.state.record().map(|r| r.days_remaining(now))
    }
}

#[derive(Debug, Clone)]
pub struct StatusReport {
    pub generated_at: DateTime<Utc>,
    pub domains: Vec<DomainStatus>,
    pub daemon_running: bool,
}

pub struct Coordinator {
    settings: Settings,
    daemon: Arc<dyn MailDaemon>,
    acme: Arc<dyn AcmeClient>,
    mediator: Arc<PortMediator>,
}

impl Coordinator {
    /// Coordinator driving Postfix and certbot
    pub fn new(settings: Settings) -> Self {
        let daemon: Arc<dyn MailDaemon> = Arc::new(PostfixService::new(&settings.postfix));
        let probe: Arc<dyn PortProbe> = Arc::new(TcpPortProbe::default());
        let acme: Arc<dyn AcmeClient> = Arc::new(Certbot::from_settings(&settings));
        Self::with_components(settings, daemon, probe, acme)
    }

    pub fn with_components(
        settings: Settings,
        daemon: Arc<dyn MailDaemon>,
        probe: Arc<dyn PortProbe>,
        acme: Arc<dyn AcmeClient>,
    ) -> Self {
        let wait = PortWait {
            attempts: settings.renewal.port_wait_attempts,
            backoff: settings.port_wait_backoff(),
        };
        let mediator = Arc::new(PortMediator::new(daemon.clone(), probe, wait));

        Self {
            settings,
            daemon,
            acme,
            mediator,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn mediator(&self) -> Arc<PortMediator> {
        self.mediator.clone()
    }

    /// Store holding the authoritative material: certbot's lineages, or the
    /// Postfix cert dir when Let's Encrypt is disabled
    pub fn store(&self) -> CertificateStore {
        if self.settings.tls.use_letsencrypt {
            CertificateStore::new(self.settings.cert_root())
        } else {
            CertificateStore::new(self.settings.postfix.cert_dir.clone())
        }
    }

    pub fn deployment_hook(&self) -> DeploymentHook {
        DeploymentHook::from_settings(&self.settings, self.daemon.clone())
    }

    pub fn selector(&self) -> ChallengeSelector {
        ChallengeSelector::new(
            self.settings.challenge_chain(),
            self.acme.clone(),
            self.mediator.clone(),
        )
    }

    pub fn scheduler(&self) -> RenewalScheduler {
        RenewalScheduler::new(
            CertificateStore::new(self.settings.cert_root()),
            self.selector(),
            self.deployment_hook(),
            self.settings.domains(),
            self.settings.renewal_window(),
            self.settings.renewal.lock_file.clone(),
        )
    }

    fn manages_renewal(&self) -> bool {
        if !self.settings.tls.enabled {
            info!("TLS disabled, nothing to manage");
            return false;
        }
        if !self.settings.tls.use_letsencrypt {
            info!("Let's Encrypt disabled, self-signed certificates are not renewed");
            return false;
        }
        true
    }

    /// One renewal pass (cron entry point)
    pub async fn renew(&self) -> Result<RunReport> {
        if !self.manages_renewal() {
            return Ok(RunReport::NothingToDo);
        }
        self.scheduler().run_once(Utc::now()).await
    }

    /// Periodic renewal until `shutdown` resolves
    pub async fn run_daemon<S>(&self, shutdown: S) -> Result<()>
    where
        S: Future<Output = ()>,
    {
        if !self.manages_renewal() {
            shutdown.await;
            return Ok(());
        }

        info!(
            interval_hours = self.settings.renewal.interval_hours,
            jitter_minutes = self.settings.renewal.jitter_minutes,
            domains = ?self.settings.tls.domains,
            "Starting renewal loop"
        );
        self.scheduler()
            .run_forever(
                self.settings.check_interval(),
                self.settings.check_jitter(),
                shutdown,
            )
            .await
    }

    /// Container start-up: reuse valid material, issue what is missing,
    /// fall back to self-signed, then deploy.
    pub async fn bootstrap(&self) -> Result<BootstrapReport> {
        let mut report = BootstrapReport::default();
        if !self.settings.tls.enabled {
            info!("TLS disabled, skipping certificate bootstrap");
            return Ok(report);
        }

        let lock_path = &self.settings.renewal.lock_file;
        let _lock = RunLock::try_acquire(lock_path)?.ok_or_else(|| {
            CertError::Lock(format!("{} is held by another run", lock_path.display()))
        })?;

        let now = Utc::now();
        let window = self.settings.renewal_window();
        let mut artifacts: Vec<CertificateArtifacts> = Vec::new();
        let mut needing: Vec<Domain> = Vec::new();

        if self.settings.tls.use_letsencrypt {
            let store = self.store();
            for domain in self.settings.domains() {
                match store.inspect(&domain.name) {
                    CertificateState::Valid(record) if !record.is_due(now, window) => {
                        info!(domain = %domain, not_after = %record.not_after, "Reusing existing certificate");
                        artifacts.push(store.paths(&domain.name).artifacts(&domain.name));
                        report.reused.push(domain.name);
                    }
                    state => {
                        info!(domain = %domain, state = %state.describe(), "Certificate needs issuance");
                        needing.push(domain);
                    }
                }
            }

            if !needing.is_empty() {
                let selection = self.bootstrap_selector().await.select(&needing).await?;
                if selection.is_success() {
                    report.issued = needing.drain(..).map(|d| d.name).collect();
                    artifacts.extend(selection.artifacts);
                } else {
                    warn!("Certificate issuance failed, falling back to self-signed certificates");
                }
            }
        } else {
            needing = self.settings.domains();
        }

        let fallback = CertificateStore::new(self.settings.postfix.cert_dir.clone());
        for domain in needing {
            artifacts.push(fallback.ensure_self_signed(&domain.name, self.settings.tls.self_signed_days)?);
            report.self_signed.push(domain.name);
        }

        let hook = self.deployment_hook();
        let deployment = if self.daemon.is_running().await {
            hook.apply(&artifacts).await?
        } else {
            hook.install_batch(&artifacts)?
        };
        report.deployment = Some(deployment);

        info!(
            reused = report.reused.len(),
            issued = report.issued.len(),
            self_signed = report.self_signed.len(),
            "Certificate bootstrap complete"
        );
        Ok(report)
    }

    /// Mediate only when the mail daemon is already up
    async fn bootstrap_selector(&self) -> ChallengeSelector {
        if self.daemon.is_running().await {
            self.selector()
        } else {
            info!("Mail daemon not running yet, issuing without port mediation");
            ChallengeSelector::without_mediation(self.settings.challenge_chain(), self.acme.clone())
        }
    }

    /// Per-domain certificate state and daemon liveness
    pub async fn status(&self, now: DateTime<Utc>) -> StatusReport {
        let store = self.store();
        let window = self.settings.renewal_window();

        let domains = self
            .settings
            .domains()
            .into_iter()
            .map(|domain| {
                let state = store.inspect(&domain.name);
                let due = state.record().map_or(true, |r| r.is_due(now, window));
                DomainStatus { domain, state, due }
            })
            .collect();

        StatusReport {
            generated_at: now,
            domains,
            daemon_running: self.daemon.is_running().await,
        }
    }

    /// Certbot deploy-hook entry point for one renewed lineage
    pub async fn deploy_hook(
        &self,
        lineage: &Path,
        renewed_domains: &[String],
    ) -> Result<DeploymentReport> {
        let name = lineage
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| CertError::Config(format!("Invalid lineage {}", lineage.display())))?;
        let root = lineage
            .parent()
            .ok_or_else(|| CertError::Config(format!("Invalid lineage {}", lineage.display())))?;

        let paths = CertificatePaths::for_domain(root, name);
        if !paths.exists() {
            return Err(CertError::Deployment(format!(
                "No certificate material in {}",
                lineage.display()
            )));
        }

        info!(lineage = %name, domains = ?renewed_domains, "Deploy hook invoked");
        self.deployment_hook().apply(&[paths.artifacts(name)]).await
    }
}
