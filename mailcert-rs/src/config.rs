//! Configuration for mailcert-rs
//!
//! Settings come either from a TOML file (`[tls]`, `[smtp]`, `[postfix]`,
//! `[renewal]`, `[logging]`) or from environment variables grouped by prefix
//! (`TLS_*`, `SMTP_*`, `POSTFIX_*`, `RENEWAL_*`, `LOG_*`).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CertError, Result};
use crate::types::{ChallengeMethod, Domain};

/// Main coordinator configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Settings {
    pub tls: TlsSettings,
    pub smtp: SmtpSettings,
    pub postfix: PostfixSettings,
    pub renewal: RenewalSettings,
    pub logging: LoggingSettings,
}

/// Preferred ACME challenge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChallengeType {
    TlsAlpn,
    Http,
}

/// Certificate issuance settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TlsSettings {
    pub enabled: bool,
    /// ACME contact email
    pub email: String,
    /// Domains to certify; empty means the SMTP hostname only
    pub domains: Vec<String>,
    pub challenge_type: ChallengeType,
    /// TLS-ALPN port override
    pub challenge_port: Option<u16>,
    pub http_port: u16,
    /// Renewal window in days
    pub renewal_days: i64,
    pub staging: bool,
    pub use_letsencrypt: bool,
    /// Certbot configuration directory (`live/` lives below it)
    pub letsencrypt_dir: PathBuf,
    pub certbot_path: String,
    /// Passed through to certbot as `--deploy-hook`
    pub deploy_hook: Option<String>,
    pub acme_timeout_secs: u64,
    pub self_signed_days: u32,
}

/// SMTP listener settings relevant to challenge port selection
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SmtpSettings {
    pub hostname: String,
    pub enable_submission: bool,
    pub enable_smtps: bool,
}

/// How to control Postfix and where its TLS configuration lives
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PostfixSettings {
    pub stop_command: Vec<String>,
    pub start_command: Vec<String>,
    pub reload_command: Vec<String>,
    /// Process name probed with `pgrep -x`
    pub process_name: String,
    pub pid_file: PathBuf,
    pub main_cf: PathBuf,
    /// Deployed copies of certificate material
    pub cert_dir: PathBuf,
}

/// Scheduler and port-mediation bounds
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RenewalSettings {
    pub interval_hours: u64,
    pub jitter_minutes: u64,
    pub lock_file: PathBuf,
    pub port_wait_attempts: u32,
    pub port_wait_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    /// "pretty" or "json"
    pub format: String,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            email: String::new(),
            domains: Vec::new(),
            challenge_type: ChallengeType::TlsAlpn,
            challenge_port: None,
            http_port: 80,
            renewal_days: 7,
            staging: false,
            use_letsencrypt: true,
            letsencrypt_dir: PathBuf::from("/etc/letsencrypt"),
            certbot_path: "certbot".to_string(),
            deploy_hook: None,
            acme_timeout_secs: 300,
            self_signed_days: 365,
        }
    }
}

impl Default for SmtpSettings {
    fn default() -> Self {
        Self {
            hostname: "mail.example.com".to_string(),
            enable_submission: true,
            enable_smtps: true,
        }
    }
}

impl Default for PostfixSettings {
    fn default() -> Self {
        Self {
            stop_command: argv(&["supervisorctl", "stop", "postfix"]),
            start_command: argv(&["supervisorctl", "start", "postfix"]),
            reload_command: argv(&["postfix", "reload"]),
            process_name: "master".to_string(),
            pid_file: PathBuf::from("/var/spool/postfix/pid/master.pid"),
            main_cf: PathBuf::from("/etc/postfix/main.cf"),
            cert_dir: PathBuf::from("/etc/postfix/certs"),
        }
    }
}

impl Default for RenewalSettings {
    fn default() -> Self {
        Self {
            interval_hours: 12,
            jitter_minutes: 60,
            lock_file: PathBuf::from("/run/mailcert.lock"),
            port_wait_attempts: 10,
            port_wait_ms: 500,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

fn argv(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

impl Settings {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CertError::Config(format!("Failed to read config file: {}", e)))?;

        let settings: Settings = toml::from_str(&content)
            .map_err(|e| CertError::Config(format!("Failed to parse config: {}", e)))?;

        settings.normalized().validated()
    }

    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_env_source(None)
    }

    /// Load configuration from an explicit variable map instead of the process
    /// environment
    pub fn from_env_map(vars: &[(&str, &str)]) -> Result<Self> {
        let map: config::Map<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Self::from_env_source(Some(map))
    }

    fn from_env_source(source: Option<config::Map<String, String>>) -> Result<Self> {
        let settings = Settings {
            tls: env_section("TLS", Some((",", &["domains"])), &source)?,
            smtp: env_section("SMTP", None, &source)?,
            postfix: env_section(
                "POSTFIX",
                Some((" ", &["stop_command", "start_command", "reload_command"])),
                &source,
            )?,
            renewal: env_section("RENEWAL", None, &source)?,
            logging: env_section("LOG", None, &source)?,
        };

        settings.normalized().validated()
    }

    fn normalized(mut self) -> Self {
        let mut domains: Vec<String> = Vec::new();
        for domain in &self.tls.domains {
            let domain = domain.trim().trim_end_matches('.').to_lowercase();
            if !domain.is_empty() && !domains.contains(&domain) {
                domains.push(domain);
            }
        }
        self.tls.domains = domains;
        self.tls.email = self.tls.email.trim().to_string();
        self.smtp.hostname = self.smtp.hostname.trim().to_lowercase();
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.smtp.hostname.is_empty() {
            return Err(CertError::Config("SMTP hostname cannot be empty".to_string()));
        }

        if self.tls.enabled && self.tls.use_letsencrypt {
            if self.tls.email.is_empty() {
                return Err(CertError::Config(
                    "TLS is enabled but no email provided for Let's Encrypt".to_string(),
                ));
            }
            if !self.tls.email.contains('@') {
                return Err(CertError::Config(format!(
                    "Invalid ACME contact email: {}",
                    self.tls.email
                )));
            }
        }

        if self.tls.renewal_days < 0 {
            return Err(CertError::Config(
                "Renewal window cannot be negative".to_string(),
            ));
        }

        if !self.smtp.enable_submission && !self.smtp.enable_smtps && self.tls.challenge_port.is_none()
        {
            return Err(CertError::Config(
                "No TLS-ALPN port: enable submission or SMTPS, or set a challenge port"
                    .to_string(),
            ));
        }

        for (name, command) in [
            ("stop", &self.postfix.stop_command),
            ("start", &self.postfix.start_command),
            ("reload", &self.postfix.reload_command),
        ] {
            if command.is_empty() {
                return Err(CertError::Config(format!(
                    "Postfix {} command cannot be empty",
                    name
                )));
            }
        }

        Ok(())
    }

    fn validated(self) -> Result<Self> {
        self.validate()?;
        Ok(self)
    }

    /// Managed domains; the SMTP hostname is primary when listed
    pub fn domains(&self) -> Vec<Domain> {
        if self.tls.domains.is_empty() {
            return vec![Domain::primary(self.smtp.hostname.clone())];
        }

        let primary = if self.tls.domains.contains(&self.smtp.hostname) {
            self.smtp.hostname.clone()
        } else {
            self.tls.domains[0].clone()
        };

        let mut domains = vec![Domain::primary(primary.clone())];
        domains.extend(
            self.tls
                .domains
                .iter()
                .filter(|d| **d != primary)
                .map(|d| Domain::secondary(d.clone())),
        );
        domains
    }

    /// Ports tried for TLS-ALPN-01 in order: the override alone, else
    /// submission (587) then SMTPS (465) for whichever is enabled
    pub fn alpn_ports(&self) -> Vec<u16> {
        if let Some(port) = self.tls.challenge_port {
            return vec![port];
        }

        let mut ports = Vec::with_capacity(2);
        if self.smtp.enable_submission {
            ports.push(587);
        }
        if self.smtp.enable_smtps {
            ports.push(465);
        }
        ports
    }

    /// Ordered fallback chain, preferred method first
    pub fn challenge_chain(&self) -> Vec<ChallengeMethod> {
        let alpn = self
            .alpn_ports()
            .into_iter()
            .map(|port| ChallengeMethod::TlsAlpn01 { port });
        let http = ChallengeMethod::Http01 {
            port: self.tls.http_port,
        };

        match self.tls.challenge_type {
            ChallengeType::TlsAlpn => alpn.chain(std::iter::once(http)).collect(),
            ChallengeType::Http => std::iter::once(http).chain(alpn).collect(),
        }
    }

    pub fn renewal_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.tls.renewal_days)
    }

    /// Directory holding one sub-directory per certified domain
    pub fn cert_root(&self) -> PathBuf {
        self.tls.letsencrypt_dir.join("live")
    }

    pub fn acme_timeout(&self) -> Duration {
        Duration::from_secs(self.tls.acme_timeout_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.renewal.interval_hours * 3600)
    }

    pub fn check_jitter(&self) -> Duration {
        Duration::from_secs(self.renewal.jitter_minutes * 60)
    }

    pub fn port_wait_backoff(&self) -> Duration {
        Duration::from_millis(self.renewal.port_wait_ms)
    }
}

fn env_section<T: DeserializeOwned>(
    prefix: &str,
    lists: Option<(&str, &[&str])>,
    source: &Option<config::Map<String, String>>,
) -> Result<T> {
    let mut env = config::Environment::with_prefix(prefix)
        .try_parsing(true)
        .source(source.clone());

    if let Some((separator, keys)) = lists {
        env = env.list_separator(separator);
        for key in keys {
            env = env.with_list_parse_key(key);
        }
    }

    config::Config::builder()
        .add_source(env)
        .build()
        .and_then(|c| c.try_deserialize::<T>())
        .map_err(|e| {
            CertError::Config(format!("Invalid {}_* environment: {}", prefix, e))
        })
}
