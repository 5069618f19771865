//! mailcert: certificate lifecycle coordinator for the mail forwarder
//!
//! Run from cron (`renew`), as a long-lived loop (`daemon`), at container
//! start (`bootstrap`) or as certbot's deploy hook (`deploy-hook`).

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use mailcert_rs::config::LoggingSettings;
use mailcert_rs::shutdown::ShutdownSignal;
use mailcert_rs::{CertError, Coordinator, RunReport, Settings};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const EXIT_OK: u8 = 0;
const EXIT_EXHAUSTED: u8 = 1;
const EXIT_DAEMON_DOWN: u8 = 2;
const EXIT_ERROR: u8 = 3;

/// Certificate lifecycle coordinator for a containerised Postfix
#[derive(Parser, Debug)]
#[command(name = "mailcert")]
#[command(version, about, long_about = None)]
struct Cli {
    /// TOML configuration file; environment variables are used when absent
    #[arg(short, long, global = true, env = "MAILCERT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Renew every certificate inside the renewal window (cron entry point)
    Renew,
    /// Check twice daily, with jitter, until stopped
    Daemon,
    /// Obtain or generate certificates at container start and deploy them
    Bootstrap,
    /// Show certificate state per domain
    Status,
    /// Deploy a lineage renewed by certbot
    DeployHook {
        /// Lineage directory, e.g. /etc/letsencrypt/live/mail.example.com
        #[arg(long, env = "RENEWED_LINEAGE")]
        lineage: PathBuf,

        /// Space-separated renewed domains
        #[arg(long, env = "RENEWED_DOMAINS", default_value = "")]
        domains: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match load_settings(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("mailcert: {:#}", e);
            return ExitCode::from(EXIT_ERROR);
        }
    };

    init_logging(&settings.logging);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start async runtime");
            return ExitCode::from(EXIT_ERROR);
        }
    };

    ExitCode::from(runtime.block_on(run(cli.command, settings)))
}

fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    match path {
        Some(path) => Settings::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display())),
        None => Settings::from_env().context("Failed to load configuration from environment"),
    }
}

/// Initialize logging; `RUST_LOG` wins over the configured level
fn init_logging(settings: &LoggingSettings) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.level));

    if settings.format == "json" {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}

async fn run(command: Command, settings: Settings) -> u8 {
    info!("Starting mailcert v{}", env!("CARGO_PKG_VERSION"));
    let coordinator = Coordinator::new(settings);

    // Installed before any pass can stop the mail daemon
    let shutdown = match ShutdownSignal::install() {
        Ok(shutdown) => shutdown,
        Err(e) => {
            error!(error = %e, "Failed to install signal handlers");
            return EXIT_ERROR;
        }
    };

    match command {
        Command::Renew => {
            tokio::select! {
                result = coordinator.renew() => renew_exit_code(result),
                _ = shutdown.wait() => interrupted(&coordinator).await,
            }
        }
        Command::Daemon => {
            let code = match coordinator.run_daemon(shutdown.wait()).await {
                Ok(()) => EXIT_OK,
                Err(e) => error_exit_code(&e),
            };
            match recover_exit_code(&coordinator).await {
                EXIT_OK => code,
                other => other,
            }
        }
        Command::Bootstrap => {
            tokio::select! {
                result = coordinator.bootstrap() => match result {
                    Ok(_) => EXIT_OK,
                    Err(e) => error_exit_code(&e),
                },
                _ = shutdown.wait() => interrupted(&coordinator).await,
            }
        }
        Command::Status => {
            print_status(&coordinator).await;
            EXIT_OK
        }
        Command::DeployHook { lineage, domains } => {
            let domains: Vec<String> = domains.split_whitespace().map(String::from).collect();
            match coordinator.deploy_hook(&lineage, &domains).await {
                Ok(report) if !report.reloaded => {
                    warn!("Certificates deployed but Postfix was not reloaded");
                    EXIT_OK
                }
                Ok(_) => EXIT_OK,
                Err(e) => error_exit_code(&e),
            }
        }
    }
}

fn renew_exit_code(result: mailcert_rs::Result<RunReport>) -> u8 {
    match result {
        Ok(RunReport::Failed(_)) => EXIT_EXHAUSTED,
        Ok(RunReport::Skipped) | Ok(RunReport::NothingToDo) | Ok(RunReport::Renewed(_)) => EXIT_OK,
        Err(e) => error_exit_code(&e),
    }
}

fn error_exit_code(e: &CertError) -> u8 {
    error!(error = %e, "Run failed");
    if e.is_fatal() {
        EXIT_DAEMON_DOWN
    } else {
        EXIT_ERROR
    }
}

/// The run was dropped mid-flight; bring the daemon back if it was suspended
async fn interrupted(coordinator: &Coordinator) -> u8 {
    warn!("Interrupted, checking mail daemon state");
    match recover_exit_code(coordinator).await {
        EXIT_OK => EXIT_ERROR,
        other => other,
    }
}

async fn recover_exit_code(coordinator: &Coordinator) -> u8 {
    match coordinator.mediator().recover().await {
        Ok(true) => {
            info!("Mail daemon restarted after interruption");
            EXIT_OK
        }
        Ok(false) => EXIT_OK,
        Err(e) => error_exit_code(&e),
    }
}

async fn print_status(coordinator: &Coordinator) {
    let now = Utc::now();
    let report = coordinator.status(now).await;

    for status in &report.domains {
        let not_after = status
            .state
            .record()
            .map(|r| r.not_after.to_rfc3339())
            .unwrap_or_else(|| "-".to_string());
        let method = status
            .state
            .record()
            .map(|r| r.method.to_string())
            .unwrap_or_else(|| "-".to_string());
        let days = status
            .days_remaining(now)
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string());

        println!(
            "{:<32} {:<28} {:<26} {:>6}  {:<12} {}",
            status.domain.name,
            status.state.describe(),
            not_after,
            days,
            method,
            if status.due { "renewal due" } else { "ok" }
        );
    }

    println!(
        "mail daemon: {}",
        if report.daemon_running { "running" } else { "not running" }
    );
}
