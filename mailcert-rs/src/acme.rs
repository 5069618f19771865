//! ACME client invocation
//!
//! The coordinator does not speak ACME itself. It drives an external client
//! (certbot by default) once per domain, with the challenge method chosen by
//! the selector. The coordinator owns the renewal decision, so certbot is told
//! to renew unconditionally and a run only counts when the leaf certificate's
//! expiry moved forward.

use async_trait::async_trait;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::Settings;
use crate::error::{CertError, Result};
use crate::store::{CertificateState, CertificateStore};
use crate::types::{CertificateArtifacts, ChallengeMethod, Domain};

/// External certificate issuer
#[async_trait]
pub trait AcmeClient: Send + Sync {
    /// Issue or renew certificates for every domain using one challenge
    /// method. Succeeds only if all domains were issued.
    async fn obtain(
        &self,
        domains: &[Domain],
        method: ChallengeMethod,
    ) -> Result<Vec<CertificateArtifacts>>;
}

/// Certbot in standalone mode
pub struct Certbot {
    program: String,
    email: String,
    config_dir: PathBuf,
    staging: bool,
    deploy_hook: Option<String>,
    timeout: Duration,
    store: CertificateStore,
}

impl Certbot {
    pub fn new(program: String, email: String, config_dir: PathBuf) -> Self {
        let store = CertificateStore::new(config_dir.join("live"));
        Self {
            program,
            email,
            config_dir,
            staging: false,
            deploy_hook: None,
            timeout: Duration::from_secs(300),
            store,
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        let mut certbot = Self::new(
            settings.tls.certbot_path.clone(),
            settings.tls.email.clone(),
            settings.tls.letsencrypt_dir.clone(),
        );
        certbot.staging = settings.tls.staging;
        certbot.deploy_hook = settings.tls.deploy_hook.clone();
        certbot.timeout = settings.acme_timeout();
        certbot
    }

    /// Arguments for one domain (program name excluded)
    pub fn command_args(&self, domain: &str, method: ChallengeMethod) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "certonly".into(),
            "--standalone".into(),
            "--non-interactive".into(),
            "--agree-tos".into(),
            "--force-renewal".into(),
            "--email".into(),
            self.email.clone(),
            "--config-dir".into(),
            self.config_dir.display().to_string(),
            "--cert-name".into(),
            domain.to_string(),
            "-d".into(),
            domain.to_string(),
            "--preferred-challenges".into(),
            method.challenge_name().into(),
        ];

        match method {
            ChallengeMethod::TlsAlpn01 { port } => {
                args.push("--tls-alpn-port".into());
                args.push(port.to_string());
            }
            ChallengeMethod::Http01 { port } => {
                args.push("--http-01-port".into());
                args.push(port.to_string());
            }
        }

        if self.staging {
            args.push("--test-cert".into());
        }

        if let Some(hook) = &self.deploy_hook {
            args.push("--deploy-hook".into());
            args.push(hook.clone());
        }

        args
    }

    async fn obtain_one(&self, domain: &str, method: ChallengeMethod) -> Result<CertificateArtifacts> {
        let before = self.store.inspect(domain).record().map(|r| r.not_after);
        let args = self.command_args(domain, method);
        debug!(program = %self.program, args = ?args, "Invoking ACME client");

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.program)
                .args(&args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| {
            CertError::Acme(format!(
                "{} timed out after {}s for {}",
                self.program,
                self.timeout.as_secs(),
                domain
            ))
        })?
        .map_err(|e| CertError::Acme(format!("Failed to run {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CertError::Acme(format!(
                "{} failed for {} ({}): {}",
                self.program,
                domain,
                output.status,
                stderr.trim()
            )));
        }

        let paths = self.store.paths(domain);
        let not_after = match self.store.inspect(domain) {
            CertificateState::Valid(record) => record.not_after,
            other => {
                return Err(CertError::Acme(format!(
                    "{} reported success but {} is {}",
                    self.program,
                    paths.dir.display(),
                    other.describe()
                )))
            }
        };

        if let Some(previous) = before.filter(|previous| not_after <= *previous) {
            return Err(CertError::Acme(format!(
                "{} left the certificate for {} unchanged (expires {})",
                self.program, domain, previous
            )));
        }

        Ok(paths.artifacts(domain))
    }
}

#[async_trait]
impl AcmeClient for Certbot {
    async fn obtain(
        &self,
        domains: &[Domain],
        method: ChallengeMethod,
    ) -> Result<Vec<CertificateArtifacts>> {
        let mut artifacts = Vec::with_capacity(domains.len());

        for domain in domains {
            match self.obtain_one(&domain.name, method).await {
                Ok(issued) => {
                    info!(domain = %domain, method = %method, "Certificate issued");
                    artifacts.push(issued);
                }
                Err(e) => {
                    warn!(domain = %domain, method = %method, error = %e, "Issuance failed");
                    return Err(e);
                }
            }
        }

        Ok(artifacts)
    }
}
