//! Challenge strategy selection
//!
//! The fallback chain is a plain state machine ([`ChallengeChain`]); the
//! [`ChallengeSelector`] drives it, invoking the ACME client and opening a
//! mediation window around every run of methods that need the mail port.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::acme::AcmeClient;
use crate::error::Result;
use crate::mediator::PortMediator;
use crate::types::{CertificateArtifacts, ChallengeMethod, Domain};

/// Position in the fallback chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChallengeState {
    Idle,
    Attempting {
        index: usize,
        method: ChallengeMethod,
    },
    Succeeded {
        method: ChallengeMethod,
    },
    ExhaustedFailure,
}

/// Ordered list of challenge methods with the current position
#[derive(Debug, Clone)]
pub struct ChallengeChain {
    methods: Vec<ChallengeMethod>,
    state: ChallengeState,
}

impl ChallengeChain {
    pub fn new(methods: Vec<ChallengeMethod>) -> Self {
        Self {
            methods,
            state: ChallengeState::Idle,
        }
    }

    pub fn state(&self) -> &ChallengeState {
        &self.state
    }

    pub fn methods(&self) -> &[ChallengeMethod] {
        &self.methods
    }

    /// Idle -> Attempting(first), or ExhaustedFailure for an empty chain
    pub fn start(&mut self) -> &ChallengeState {
        if self.state == ChallengeState::Idle {
            self.state = self.attempting(0);
        }
        &self.state
    }

    /// Method currently being attempted
    pub fn current(&self) -> Option<ChallengeMethod> {
        match self.state {
            ChallengeState::Attempting { method, .. } => Some(method),
            _ => None,
        }
    }

    pub fn record_success(&mut self) {
        if let ChallengeState::Attempting { method, .. } = self.state {
            self.state = ChallengeState::Succeeded { method };
        }
    }

    /// Advance to the next method; ExhaustedFailure after the last one
    pub fn record_failure(&mut self) {
        if let ChallengeState::Attempting { index, .. } = self.state {
            self.state = self.attempting(index + 1);
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.state,
            ChallengeState::Succeeded { .. } | ChallengeState::ExhaustedFailure
        )
    }

    /// Ports of the consecutive mail-port methods starting at the current one
    pub fn mediated_run_ports(&self) -> Vec<u16> {
        let start = match self.state {
            ChallengeState::Attempting { index, .. } => index,
            _ => return Vec::new(),
        };

        let mut ports = Vec::new();
        for method in self.methods[start..]
            .iter()
            .take_while(|m| m.needs_mail_port())
        {
            if !ports.contains(&method.port()) {
                ports.push(method.port());
            }
        }
        ports
    }

    fn attempting(&self, index: usize) -> ChallengeState {
        match self.methods.get(index) {
            Some(method) => ChallengeState::Attempting {
                index,
                method: *method,
            },
            None => ChallengeState::ExhaustedFailure,
        }
    }
}

/// One invocation of the ACME client with one method
#[derive(Debug, Clone)]
pub struct MethodAttempt {
    pub method: ChallengeMethod,
    pub succeeded: bool,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Bounds of one period during which the mail daemon was stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MediationWindow {
    pub released_at: DateTime<Utc>,
    pub reacquired_at: DateTime<Utc>,
}

/// Result of walking the fallback chain for one domain set
#[derive(Debug, Clone)]
pub struct SelectionReport {
    pub final_state: ChallengeState,
    pub attempts: Vec<MethodAttempt>,
    pub artifacts: Vec<CertificateArtifacts>,
    pub windows: Vec<MediationWindow>,
}

impl SelectionReport {
    pub fn succeeded_with(&self) -> Option<ChallengeMethod> {
        match self.final_state {
            ChallengeState::Succeeded { method } => Some(method),
            _ => None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.succeeded_with().is_some()
    }
}

struct Progress {
    chain: ChallengeChain,
    attempts: Vec<MethodAttempt>,
    artifacts: Vec<CertificateArtifacts>,
}

/// Walks the fallback chain against the ACME client
pub struct ChallengeSelector {
    methods: Vec<ChallengeMethod>,
    acme: Arc<dyn AcmeClient>,
    mediator: Option<Arc<PortMediator>>,
}

impl ChallengeSelector {
    pub fn new(
        methods: Vec<ChallengeMethod>,
        acme: Arc<dyn AcmeClient>,
        mediator: Arc<PortMediator>,
    ) -> Self {
        Self {
            methods,
            acme,
            mediator: Some(mediator),
        }
    }

    /// Selector that never stops the mail daemon (used before it first starts)
    pub fn without_mediation(methods: Vec<ChallengeMethod>, acme: Arc<dyn AcmeClient>) -> Self {
        Self {
            methods,
            acme,
            mediator: None,
        }
    }

    pub fn methods(&self) -> &[ChallengeMethod] {
        &self.methods
    }

    /// Try each method in order until one issues every domain.
    ///
    /// Method failures advance the chain. Mediation failures (lease held,
    /// daemon not restarted) abort and are returned as errors.
    pub async fn select(&self, domains: &[Domain]) -> Result<SelectionReport> {
        let mut chain = ChallengeChain::new(self.methods.clone());
        chain.start();

        let mut progress = Progress {
            chain,
            attempts: Vec::new(),
            artifacts: Vec::new(),
        };
        let mut windows = Vec::new();

        while let Some(method) = progress.chain.current() {
            match &self.mediator {
                Some(mediator) if method.needs_mail_port() => {
                    let ports = progress.chain.mediated_run_ports();
                    let mediated = mediator
                        .with_port_suspended(&ports, move || async move {
                            let mut progress = progress;
                            self.drive(&mut progress, domains, Some(true)).await;
                            progress
                        })
                        .await?;

                    windows.push(MediationWindow {
                        released_at: mediated.released_at,
                        reacquired_at: mediated.reacquired_at,
                    });
                    progress = mediated.value;
                }
                Some(_) => self.drive(&mut progress, domains, Some(false)).await,
                None => self.drive(&mut progress, domains, None).await,
            }
        }

        match progress.chain.state() {
            ChallengeState::Succeeded { method } => {
                info!(method = %method, attempts = progress.attempts.len(), "Challenge chain succeeded");
            }
            _ => {
                error!(attempts = progress.attempts.len(), "All challenge methods failed");
            }
        }

        Ok(SelectionReport {
            final_state: progress.chain.state().clone(),
            attempts: progress.attempts,
            artifacts: progress.artifacts,
            windows,
        })
    }

    /// Attempt methods while they match the requested mediation mode
    async fn drive(&self, progress: &mut Progress, domains: &[Domain], mediated: Option<bool>) {
        while let Some(method) = progress.chain.current() {
            if mediated.is_some_and(|m| m != method.needs_mail_port()) {
                break;
            }

            let names: Vec<&str> = domains.iter().map(|d| d.name.as_str()).collect();
            info!(method = %method, domains = ?names, "Attempting certificate issuance");

            let started_at = Utc::now();
            let result = self.acme.obtain(domains, method).await;
            let finished_at = Utc::now();

            match result {
                Ok(artifacts) => {
                    progress.chain.record_success();
                    progress.artifacts = artifacts;
                    progress.attempts.push(MethodAttempt {
                        method,
                        succeeded: true,
                        error: None,
                        started_at,
                        finished_at,
                    });
                }
                Err(e) => {
                    warn!(method = %method, error = %e, "Challenge method failed");
                    progress.chain.record_failure();
                    progress.attempts.push(MethodAttempt {
                        method,
                        succeeded: false,
                        error: Some(e.to_string()),
                        started_at,
                        finished_at,
                    });
                }
            }
        }
    }
}
