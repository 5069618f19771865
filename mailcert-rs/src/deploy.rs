//! Deployment of issued material into Postfix
//!
//! Copies each certificate pair under the Postfix cert directory, points
//! `main.cf` at the primary domain's pair and asks Postfix to reload. A batch
//! without the primary leaves `main.cf` alone. A failed reload is reported,
//! never rolled back.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};

use crate::config::Settings;
use crate::daemon::MailDaemon;
use crate::error::{CertError, Result};
use crate::postfix::{self, CERT_FILE_KEY, KEY_FILE_KEY};
use crate::store::{write_private_key, CertificatePaths};
use crate::types::CertificateArtifacts;

/// What one deployment batch did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeploymentReport {
    pub domains: Vec<String>,
    pub config_updated: bool,
    pub reloaded: bool,
}

pub struct DeploymentHook {
    cert_dir: PathBuf,
    main_cf: PathBuf,
    /// Domain served on the SMTP listeners; `None` serves the first artifact
    primary: Option<String>,
    daemon: Arc<dyn MailDaemon>,
}

impl DeploymentHook {
    pub fn new(
        cert_dir: impl Into<PathBuf>,
        main_cf: impl Into<PathBuf>,
        primary: Option<String>,
        daemon: Arc<dyn MailDaemon>,
    ) -> Self {
        Self {
            cert_dir: cert_dir.into(),
            main_cf: main_cf.into(),
            primary,
            daemon,
        }
    }

    pub fn from_settings(settings: &Settings, daemon: Arc<dyn MailDaemon>) -> Self {
        let primary = settings
            .domains()
            .into_iter()
            .find(|d| d.is_primary())
            .map(|d| d.name);

        Self::new(
            settings.postfix.cert_dir.clone(),
            settings.postfix.main_cf.clone(),
            primary,
            daemon,
        )
    }

    /// Where a domain's material lives once deployed
    pub fn deployed_paths(&self, domain: &str) -> CertificatePaths {
        CertificatePaths::for_domain(&self.cert_dir, domain)
    }

    /// Deploy a batch: copy every pair, update main.cf, reload once
    pub async fn apply(&self, artifacts: &[CertificateArtifacts]) -> Result<DeploymentReport> {
        let mut report = self.install_batch(artifacts)?;
        if report.domains.is_empty() {
            return Ok(report);
        }

        match self.daemon.reload().await {
            Ok(()) => {
                report.reloaded = true;
                info!(domains = ?report.domains, "Deployment applied, mail daemon reloaded");
            }
            Err(e) => {
                error!(
                    domains = ?report.domains,
                    error = %e,
                    "Mail daemon reload failed, configuration left updated"
                );
            }
        }

        Ok(report)
    }

    /// Copy every pair and update main.cf without touching the daemon
    pub fn install_batch(&self, artifacts: &[CertificateArtifacts]) -> Result<DeploymentReport> {
        let mut report = DeploymentReport::default();
        let Some(first) = artifacts.first() else {
            return Ok(report);
        };

        for artifact in artifacts {
            self.install(artifact)?;
            report.domains.push(artifact.domain.clone());
        }

        let selected = match &self.primary {
            Some(primary) => artifacts.iter().find(|a| &a.domain == primary),
            None => Some(first),
        };
        let Some(selected) = selected else {
            info!(
                primary = ?self.primary,
                domains = ?report.domains,
                "Primary domain not in batch, main.cf left unchanged"
            );
            return Ok(report);
        };
        let deployed = self.deployed_paths(&selected.domain);

        let chain = deployed.chain_path.display().to_string();
        let key = deployed.key_path.display().to_string();
        report.config_updated = postfix::set_parameters(
            &self.main_cf,
            &[(CERT_FILE_KEY, chain.as_str()), (KEY_FILE_KEY, key.as_str())],
        )?;

        Ok(report)
    }

    fn install(&self, artifact: &CertificateArtifacts) -> Result<()> {
        let target = self.deployed_paths(&artifact.domain);

        fs::create_dir_all(&target.dir).map_err(|e| {
            CertError::Deployment(format!("Failed to create {}: {}", target.dir.display(), e))
        })?;

        let chain = fs::read(&artifact.chain_path).map_err(|e| {
            CertError::Deployment(format!(
                "Failed to read {}: {}",
                artifact.chain_path.display(),
                e
            ))
        })?;
        let key = fs::read(&artifact.key_path).map_err(|e| {
            CertError::Deployment(format!("Failed to read {}: {}", artifact.key_path.display(), e))
        })?;

        fs::write(&target.chain_path, chain).map_err(|e| {
            CertError::Deployment(format!(
                "Failed to write {}: {}",
                target.chain_path.display(),
                e
            ))
        })?;
        write_private_key(&target.key_path, &key)?;

        info!(domain = %artifact.domain, dir = ?target.dir, "Installed certificate material");
        Ok(())
    }
}
