//! mailcert-rs: certificate lifecycle for a containerised Postfix
//!
//! Keeps the mail forwarder's TLS certificates issued and renewed through an
//! external ACME client (certbot), and deploys them into Postfix.
//!
//! # Features
//!
//! - Renewal of every domain inside the renewal window in a single run
//! - TLS-ALPN-01 with fallback to HTTP-01, as an explicit state machine
//! - Scoped stop/start of Postfix while TLS-ALPN needs its port, with a
//!   guaranteed restart on every exit path
//! - Deployment into `main.cf` followed by a non-disruptive reload
//! - Self-signed bootstrap when no real certificate can be obtained
//!
//! # Example Configuration
//!
//! ```toml
//! [tls]
//! email = "admin@example.com"
//! domains = ["mail.example.com", "example.com"]
//! challenge_type = "tls-alpn"
//! renewal_days = 7
//!
//! [smtp]
//! hostname = "mail.example.com"
//!
//! [postfix]
//! stop_command = ["supervisorctl", "stop", "postfix"]
//! start_command = ["supervisorctl", "start", "postfix"]
//! ```

pub mod acme;
pub mod challenge;
pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod deploy;
pub mod error;
pub mod lock;
pub mod mediator;
pub mod postfix;
pub mod probe;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod types;

pub use config::Settings;
pub use coordinator::Coordinator;
pub use error::{CertError, Result};
pub use scheduler::{RenewalScheduler, RunReport};
