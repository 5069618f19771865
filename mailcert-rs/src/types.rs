//! Shared vocabulary: domains, challenge methods, issued artifacts

use std::fmt;
use std::path::PathBuf;

/// Role of a domain in the mail deployment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DomainRole {
    /// The SMTP hostname; its certificate is the one Postfix serves
    Primary,
    /// Any other name the forwarder receives mail for
    Secondary,
}

/// A DNS name requiring a certificate
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Domain {
    pub name: String,
    pub role: DomainRole,
}

impl Domain {
    pub fn primary(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: DomainRole::Primary,
        }
    }

    pub fn secondary(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            role: DomainRole::Secondary,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.role == DomainRole::Primary
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// ACME domain-validation method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChallengeMethod {
    /// TLS-ALPN-01, answered on a port normally owned by the mail daemon
    TlsAlpn01 { port: u16 },
    /// HTTP-01, answered on a plain HTTP port
    Http01 { port: u16 },
}

impl ChallengeMethod {
    /// Port the ACME client binds while answering the challenge
    pub fn port(&self) -> u16 {
        match self {
            ChallengeMethod::TlsAlpn01 { port } | ChallengeMethod::Http01 { port } => *port,
        }
    }

    /// Whether the mail daemon must be stopped for this method
    pub fn needs_mail_port(&self) -> bool {
        matches!(self, ChallengeMethod::TlsAlpn01 { .. })
    }

    /// Name as the ACME client spells it
    pub fn challenge_name(&self) -> &'static str {
        match self {
            ChallengeMethod::TlsAlpn01 { .. } => "tls-alpn-01",
            ChallengeMethod::Http01 { .. } => "http-01",
        }
    }
}

impl fmt::Display for ChallengeMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} on port {}", self.challenge_name(), self.port())
    }
}

/// How a certificate on disk came to be
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssuanceMethod {
    /// Issued by the ACME client using the given challenge
    Acme(ChallengeMethod),
    /// Generated locally as a bootstrap placeholder
    SelfSigned,
    /// Found on disk with no known provenance
    Unknown,
}

impl fmt::Display for IssuanceMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssuanceMethod::Acme(method) => write!(f, "acme ({})", method),
            IssuanceMethod::SelfSigned => write!(f, "self-signed"),
            IssuanceMethod::Unknown => write!(f, "unknown"),
        }
    }
}

/// Locations of freshly issued certificate material
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateArtifacts {
    pub domain: String,
    pub chain_path: PathBuf,
    pub key_path: PathBuf,
}
