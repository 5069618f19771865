//! Error types for mailcert-rs

use thiserror::Error;

/// Result type alias for coordinator operations
pub type Result<T> = std::result::Result<T, CertError>;

/// Coordinator error types
#[derive(Error, Debug)]
pub enum CertError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// ACME client invocation failed for one challenge method
    #[error("ACME error: {0}")]
    Acme(String),

    /// Certificate material could not be read or generated
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Mail daemon control command failed
    #[error("Mail daemon error: {0}")]
    Daemon(String),

    /// Mail daemon is not running after a mediated window
    #[error("Mail daemon did not come back after restart: {0}")]
    DaemonNotRestarted(String),

    /// A port lease is already open in this process
    #[error("Port lease already held")]
    LeaseHeld,

    /// Run lock could not be acquired or created
    #[error("Run lock error: {0}")]
    Lock(String),

    /// Deployment into the mail daemon's configuration failed
    #[error("Deployment error: {0}")]
    Deployment(String),
}

impl CertError {
    /// Whether the condition needs an operator (daemon left down)
    pub fn is_fatal(&self) -> bool {
        matches!(self, CertError::DaemonNotRestarted(_))
    }
}
