//! Mail daemon control
//!
//! Postfix usually runs under supervisord in the container, but the control
//! commands are configurable. When a command fails, stop and reload fall back
//! to signalling the master process directly.

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::PostfixSettings;
use crate::error::{CertError, Result};

/// Start/stop/reload/status over a mail-transfer daemon
#[async_trait]
pub trait MailDaemon: Send + Sync {
    async fn stop(&self) -> Result<()>;

    async fn start(&self) -> Result<()>;

    /// Non-disruptive configuration reload
    async fn reload(&self) -> Result<()>;

    async fn is_running(&self) -> bool;
}

/// Postfix controlled through external commands
pub struct PostfixService {
    stop_command: Vec<String>,
    start_command: Vec<String>,
    reload_command: Vec<String>,
    process_name: String,
    pid_file: PathBuf,
}

impl PostfixService {
    pub fn new(settings: &PostfixSettings) -> Self {
        Self {
            stop_command: settings.stop_command.clone(),
            start_command: settings.start_command.clone(),
            reload_command: settings.reload_command.clone(),
            process_name: settings.process_name.clone(),
            pid_file: settings.pid_file.clone(),
        }
    }

    async fn run(&self, argv: &[String]) -> Result<()> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| CertError::Daemon("Empty control command".to_string()))?;

        debug!(command = ?argv, "Running daemon control command");
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| CertError::Daemon(format!("Failed to run {}: {}", program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CertError::Daemon(format!(
                "{} exited with {}: {}",
                argv.join(" "),
                output.status,
                stderr.trim()
            )));
        }

        Ok(())
    }

    /// Master process id from the pid file
    async fn master_pid(&self) -> Option<Pid> {
        let content = tokio::fs::read_to_string(&self.pid_file).await.ok()?;
        content.trim().parse::<i32>().ok().map(Pid::from_raw)
    }

    async fn signal_master(&self, signal: Signal) -> Result<()> {
        let pid = self.master_pid().await.ok_or_else(|| {
            CertError::Daemon(format!("No usable pid in {}", self.pid_file.display()))
        })?;

        kill(pid, signal)
            .map_err(|e| CertError::Daemon(format!("Failed to send {} to {}: {}", signal, pid, e)))?;

        info!(pid = %pid, signal = %signal, "Signalled mail daemon directly");
        Ok(())
    }
}

#[async_trait]
impl MailDaemon for PostfixService {
    async fn stop(&self) -> Result<()> {
        match self.run(&self.stop_command).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "Stop command failed, falling back to SIGTERM");
                self.signal_master(Signal::SIGTERM).await
            }
        }
    }

    async fn start(&self) -> Result<()> {
        self.run(&self.start_command).await
    }

    async fn reload(&self) -> Result<()> {
        match self.run(&self.reload_command).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(error = %e, "Reload command failed, falling back to SIGHUP");
                self.signal_master(Signal::SIGHUP).await
            }
        }
    }

    async fn is_running(&self) -> bool {
        match Command::new("pgrep")
            .arg("-x")
            .arg(&self.process_name)
            .output()
            .await
        {
            Ok(output) => output.status.success(),
            Err(e) => {
                // No pgrep in the image: fall back to probing the pid
                debug!(error = %e, "pgrep unavailable");
                match self.master_pid().await {
                    Some(pid) => kill(pid, None).is_ok(),
                    None => false,
                }
            }
        }
    }
}
