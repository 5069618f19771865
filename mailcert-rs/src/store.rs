//! Certificate store
//!
//! Reads the persisted layout `<root>/<domain>/{fullchain.pem,privkey.pem}`
//! and reports what each domain directory holds.

use chrono::{DateTime, Datelike, Duration, Utc};
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{CertError, Result};
use crate::types::{CertificateArtifacts, IssuanceMethod};

/// Chain file name inside a domain directory
pub const CHAIN_FILE: &str = "fullchain.pem";
/// Private key file name inside a domain directory
pub const KEY_FILE: &str = "privkey.pem";

/// Certificate material known for a domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRecord {
    pub domain: String,
    pub not_after: DateTime<Utc>,
    pub chain_path: PathBuf,
    pub key_path: PathBuf,
    pub method: IssuanceMethod,
}

impl CertificateRecord {
    /// Whole days left before expiry (negative once expired)
    pub fn days_remaining(&self, now: DateTime<Utc>) -> i64 {
        (self.not_after - now).num_days()
    }

    /// Whether the certificate expires within `window` of `now`
    pub fn is_due(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.not_after - now <= window
    }

    /// Fresh record for the same material, tagged with how it was issued
    pub fn issued_by(&self, method: IssuanceMethod) -> Self {
        Self {
            method,
            ..self.clone()
        }
    }
}

/// Which half of a certificate pair is absent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterialKind {
    Chain,
    Key,
}

/// What the store found for one domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateState {
    Valid(CertificateRecord),
    Missing,
    Partial { missing: MaterialKind },
    Unreadable { reason: String },
}

impl CertificateState {
    pub fn record(&self) -> Option<&CertificateRecord> {
        match self {
            CertificateState::Valid(record) => Some(record),
            _ => None,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            CertificateState::Valid(_) => "valid".to_string(),
            CertificateState::Missing => "missing".to_string(),
            CertificateState::Partial {
                missing: MaterialKind::Chain,
            } => "partial (chain missing)".to_string(),
            CertificateState::Partial {
                missing: MaterialKind::Key,
            } => "partial (key missing)".to_string(),
            CertificateState::Unreadable { reason } => format!("unreadable ({})", reason),
        }
    }
}

/// Certificate storage paths for a domain
#[derive(Debug, Clone)]
pub struct CertificatePaths {
    pub dir: PathBuf,
    pub chain_path: PathBuf,
    pub key_path: PathBuf,
}

impl CertificatePaths {
    pub fn for_domain(root: &Path, domain: &str) -> Self {
        let dir = root.join(domain);
        Self {
            chain_path: dir.join(CHAIN_FILE),
            key_path: dir.join(KEY_FILE),
            dir,
        }
    }

    pub fn exists(&self) -> bool {
        self.chain_path.exists() && self.key_path.exists()
    }

    pub fn artifacts(&self, domain: &str) -> CertificateArtifacts {
        CertificateArtifacts {
            domain: domain.to_string(),
            chain_path: self.chain_path.clone(),
            key_path: self.key_path.clone(),
        }
    }
}

/// Read-only view over a certificate directory tree
#[derive(Debug, Clone)]
pub struct CertificateStore {
    root: PathBuf,
}

impl CertificateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn paths(&self, domain: &str) -> CertificatePaths {
        CertificatePaths::for_domain(&self.root, domain)
    }

    /// Inspect a single domain directory
    pub fn inspect(&self, domain: &str) -> CertificateState {
        let paths = self.paths(domain);

        match (paths.chain_path.exists(), paths.key_path.exists()) {
            (false, false) => CertificateState::Missing,
            (false, true) => CertificateState::Partial {
                missing: MaterialKind::Chain,
            },
            (true, false) => CertificateState::Partial {
                missing: MaterialKind::Key,
            },
            (true, true) => match read_leaf(&paths.chain_path) {
                Ok(leaf) => CertificateState::Valid(CertificateRecord {
                    domain: domain.to_string(),
                    not_after: leaf.not_after,
                    chain_path: paths.chain_path,
                    key_path: paths.key_path,
                    method: if leaf.self_signed {
                        IssuanceMethod::SelfSigned
                    } else {
                        IssuanceMethod::Unknown
                    },
                }),
                Err(e) => CertificateState::Unreadable {
                    reason: e.to_string(),
                },
            },
        }
    }

    /// Every domain directory under the root, sorted by name
    pub fn enumerate(&self) -> Result<Vec<(String, CertificateState)>> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut domains = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                domains.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        domains.sort();

        Ok(domains
            .into_iter()
            .map(|domain| {
                let state = self.inspect(&domain);
                (domain, state)
            })
            .collect())
    }

    /// Generate a throwaway self-signed certificate unless complete material
    /// already exists
    pub fn ensure_self_signed(&self, domain: &str, days_valid: u32) -> Result<CertificateArtifacts> {
        let paths = self.paths(domain);
        if paths.exists() {
            info!(domain = %domain, "Certificate material already present, keeping it");
            return Ok(paths.artifacts(domain));
        }

        fs::create_dir_all(&paths.dir).map_err(|e| {
            CertError::Certificate(format!("Failed to create cert directory: {}", e))
        })?;

        let not_after = Utc::now() + Duration::days(i64::from(days_valid));
        let (chain_pem, key_pem) = generate_self_signed(domain, not_after)?;

        fs::write(&paths.chain_path, chain_pem)
            .map_err(|e| CertError::Certificate(format!("Failed to write certificate: {}", e)))?;
        write_private_key(&paths.key_path, key_pem.as_bytes())?;

        info!(domain = %domain, path = ?paths.chain_path, "Created self-signed certificate");
        Ok(paths.artifacts(domain))
    }
}

struct LeafInfo {
    not_after: DateTime<Utc>,
    self_signed: bool,
}

/// Parse the first certificate of a PEM chain
fn read_leaf(chain_path: &Path) -> Result<LeafInfo> {
    let file = File::open(chain_path)
        .map_err(|e| CertError::Certificate(format!("Failed to open certificate: {}", e)))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .map_err(|e| CertError::Certificate(format!("Failed to read certificates: {}", e)))?;
    let leaf = certs
        .first()
        .ok_or_else(|| CertError::Certificate("No certificates found in file".to_string()))?;

    let (_, cert) = x509_parser::parse_x509_certificate(leaf)
        .map_err(|e| CertError::Certificate(format!("Invalid X509 certificate: {}", e)))?;

    let timestamp = cert.validity().not_after.timestamp();
    let not_after = DateTime::<Utc>::from_timestamp(timestamp, 0).ok_or_else(|| {
        CertError::Certificate(format!("Expiry out of range: {}", timestamp))
    })?;

    debug!(path = ?chain_path, %not_after, "Parsed certificate expiry");
    Ok(LeafInfo {
        not_after,
        self_signed: cert.issuer().to_string() == cert.subject().to_string(),
    })
}

/// Build a self-signed certificate valid until the given day
pub fn generate_self_signed(domain: &str, not_after: DateTime<Utc>) -> Result<(String, String)> {
    let mut params = rcgen::CertificateParams::new(vec![domain.to_string()])
        .map_err(|e| CertError::Certificate(format!("Invalid certificate name: {}", e)))?;
    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, domain);
    params.not_after = rcgen::date_time_ymd(
        not_after.year(),
        not_after.month() as u8,
        not_after.day() as u8,
    );

    let key_pair = rcgen::KeyPair::generate()
        .map_err(|e| CertError::Certificate(format!("Failed to generate key: {}", e)))?;
    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CertError::Certificate(format!("Failed to generate certificate: {}", e)))?;

    Ok((cert.pem(), key_pair.serialize_pem()))
}

/// Write key material readable by the owner only
pub(crate) fn write_private_key(path: &Path, contents: &[u8]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let mut file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .map_err(|e| CertError::Certificate(format!("Failed to write private key: {}", e)))?;
    // Mode only applies on creation
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    file.write_all(contents)?;
    Ok(())
}
