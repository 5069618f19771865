//! Fakes shared by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use mailcert_rs::acme::AcmeClient;
use mailcert_rs::daemon::MailDaemon;
use mailcert_rs::mediator::{PortMediator, PortWait};
use mailcert_rs::probe::PortProbe;
use mailcert_rs::store::{generate_self_signed, CertificatePaths, CHAIN_FILE, KEY_FILE};
use mailcert_rs::types::{CertificateArtifacts, ChallengeMethod, Domain};
use mailcert_rs::{CertError, Coordinator, Result, Settings};
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Ordered record of daemon and ACME calls
#[derive(Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }
}

pub struct FakeDaemon {
    journal: Journal,
    running: AtomicBool,
    restart_works: AtomicBool,
    reload_fails: AtomicBool,
    stops: AtomicUsize,
    starts: AtomicUsize,
    reloads: AtomicUsize,
}

impl FakeDaemon {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            running: AtomicBool::new(true),
            restart_works: AtomicBool::new(true),
            reload_fails: AtomicBool::new(false),
            stops: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
            reloads: AtomicUsize::new(0),
        }
    }

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn break_restart(&self) {
        self.restart_works.store(false, Ordering::SeqCst);
    }

    pub fn fail_reload(&self) {
        self.reload_fails.store(true, Ordering::SeqCst);
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn reloads(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MailDaemon for FakeDaemon {
    async fn stop(&self) -> Result<()> {
        self.journal.push("stop");
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.journal.push("start");
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.restart_works.load(Ordering::SeqCst) {
            self.running.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(CertError::Daemon("postfix refused to start".to_string()))
        }
    }

    async fn reload(&self) -> Result<()> {
        self.journal.push("reload");
        self.reloads.fetch_add(1, Ordering::SeqCst);
        if self.reload_fails.load(Ordering::SeqCst) {
            Err(CertError::Daemon("postfix reload failed".to_string()))
        } else {
            Ok(())
        }
    }

    async fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Probe reporting a fixed set of busy ports
#[derive(Default)]
pub struct FakeProbe {
    busy: Mutex<HashSet<u16>>,
    checked: Mutex<Vec<u16>>,
}

impl FakeProbe {
    pub fn set_busy(&self, port: u16) {
        self.busy.lock().unwrap().insert(port);
    }

    pub fn checked(&self) -> Vec<u16> {
        self.checked.lock().unwrap().clone()
    }
}

#[async_trait]
impl PortProbe for FakeProbe {
    async fn is_in_use(&self, port: u16) -> bool {
        self.checked.lock().unwrap().push(port);
        self.busy.lock().unwrap().contains(&port)
    }
}

/// ACME client that writes real (self-signed) material on success
pub struct FakeAcme {
    root: PathBuf,
    journal: Journal,
    alpn_ok: AtomicBool,
    http_ok: AtomicBool,
    failing_ports: Mutex<HashSet<u16>>,
    calls: Mutex<Vec<(Vec<String>, ChallengeMethod)>>,
}

impl FakeAcme {
    pub fn new(root: PathBuf, journal: Journal, alpn_ok: bool, http_ok: bool) -> Self {
        Self {
            root,
            journal,
            alpn_ok: AtomicBool::new(alpn_ok),
            http_ok: AtomicBool::new(http_ok),
            failing_ports: Mutex::new(HashSet::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Reject TLS-ALPN-01 on one port while other ports keep working
    pub fn fail_port(&self, port: u16) {
        self.failing_ports.lock().unwrap().insert(port);
    }

    pub fn calls(&self) -> Vec<(Vec<String>, ChallengeMethod)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl AcmeClient for FakeAcme {
    async fn obtain(
        &self,
        domains: &[Domain],
        method: ChallengeMethod,
    ) -> Result<Vec<CertificateArtifacts>> {
        self.journal.push(format!("acme:{}", method.challenge_name()));
        self.calls.lock().unwrap().push((
            domains.iter().map(|d| d.name.clone()).collect(),
            method,
        ));

        let ok = match method {
            ChallengeMethod::TlsAlpn01 { port } => {
                self.alpn_ok.load(Ordering::SeqCst)
                    && !self.failing_ports.lock().unwrap().contains(&port)
            }
            ChallengeMethod::Http01 { .. } => self.http_ok.load(Ordering::SeqCst),
        };
        if !ok {
            return Err(CertError::Acme(format!("validation failed with {}", method)));
        }

        let mut artifacts = Vec::new();
        for domain in domains {
            write_cert(&self.root, &domain.name, Utc::now() + Duration::days(90));
            artifacts.push(CertificatePaths::for_domain(&self.root, &domain.name).artifacts(&domain.name));
        }
        Ok(artifacts)
    }
}

/// Formatted log output captured for assertions
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Route this thread's events into a buffer until the guard drops
pub fn capture_logs() -> (LogBuffer, tracing::subscriber::DefaultGuard) {
    let buffer = LogBuffer::default();
    let writer = buffer.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_max_level(tracing::Level::INFO)
        .with_writer(move || writer.clone())
        .finish();
    (buffer, tracing::subscriber::set_default(subscriber))
}

/// Write a certificate pair expiring at `not_after`
pub fn write_cert(root: &Path, domain: &str, not_after: DateTime<Utc>) {
    let dir = root.join(domain);
    std::fs::create_dir_all(&dir).unwrap();
    let (chain, key) = generate_self_signed(domain, not_after).unwrap();
    std::fs::write(dir.join(CHAIN_FILE), chain).unwrap();
    std::fs::write(dir.join(KEY_FILE), key).unwrap();
}

pub fn fast_wait() -> PortWait {
    PortWait {
        attempts: 2,
        backoff: std::time::Duration::from_millis(1),
    }
}

pub fn test_settings(dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.tls.email = "admin@example.com".to_string();
    settings.tls.domains = vec!["mail.example.com".to_string(), "example.com".to_string()];
    settings.tls.letsencrypt_dir = dir.join("letsencrypt");
    settings.smtp.hostname = "mail.example.com".to_string();
    settings.postfix.main_cf = dir.join("postfix").join("main.cf");
    settings.postfix.cert_dir = dir.join("postfix").join("certs");
    settings.renewal.lock_file = dir.join("mailcert.lock");
    settings.renewal.port_wait_attempts = 2;
    settings.renewal.port_wait_ms = 1;
    settings
}

/// Coordinator wired to fakes inside a temporary directory
pub struct Harness {
    pub dir: TempDir,
    pub journal: Journal,
    pub daemon: Arc<FakeDaemon>,
    pub probe: Arc<FakeProbe>,
    pub acme: Arc<FakeAcme>,
    pub settings: Settings,
}

impl Harness {
    pub fn new(alpn_ok: bool, http_ok: bool) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let settings = test_settings(dir.path());
        Self::with_settings(dir, settings, alpn_ok, http_ok)
    }

    pub fn with_settings(dir: TempDir, settings: Settings, alpn_ok: bool, http_ok: bool) -> Self {
        let journal = Journal::default();
        let daemon = Arc::new(FakeDaemon::new(journal.clone()));
        let probe = Arc::new(FakeProbe::default());
        let acme = Arc::new(FakeAcme::new(
            settings.cert_root(),
            journal.clone(),
            alpn_ok,
            http_ok,
        ));

        Self {
            dir,
            journal,
            daemon,
            probe,
            acme,
            settings,
        }
    }

    pub fn coordinator(&self) -> Coordinator {
        Coordinator::with_components(
            self.settings.clone(),
            self.daemon.clone(),
            self.probe.clone(),
            self.acme.clone(),
        )
    }

    pub fn mediator(&self) -> Arc<PortMediator> {
        Arc::new(PortMediator::new(
            self.daemon.clone(),
            self.probe.clone(),
            fast_wait(),
        ))
    }

    pub fn cert_root(&self) -> PathBuf {
        self.settings.cert_root()
    }

    pub fn main_cf(&self) -> String {
        std::fs::read_to_string(&self.settings.postfix.main_cf).unwrap_or_default()
    }
}
