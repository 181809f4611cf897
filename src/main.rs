use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

use ledgerload::config::Config;
use ledgerload::harness::{RunReport, Runner};

/// Ramping load harness for the ledger posting API.
#[derive(Parser)]
#[command(name = "ledgerload", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides the config file's log_level.
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

// Exit codes: 0 = all thresholds passed, 1 = at least one threshold failed,
// 2 = configuration or runtime error. This lets pipelines gate on the run.
const EXIT_THRESHOLD_FAILED: u8 = 1;
const EXIT_ERROR: u8 = 2;

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("ledgerload {}", version::full());
        return ExitCode::SUCCESS;
    }

    match run_gate(&cli) {
        Ok(report) => {
            println!("{}", report.verdict);
            if report.verdict.passed {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(EXIT_THRESHOLD_FAILED)
            }
        }
        Err(e) => {
            eprintln!("ledgerload: {e:#}");
            ExitCode::from(EXIT_ERROR)
        }
    }
}

fn run_gate(cli: &Cli) -> Result<RunReport> {
    // Config is required for a load run.
    let config_path = cli
        .config
        .as_ref()
        .context("--config is required (use --help for usage)")?;

    let cfg = Config::load(config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;

    // Initialize tracing. The CLI flag wins over the config file.
    let log_level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting ledgerload",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(async { run(cfg).await })
}

async fn run(cfg: Config) -> Result<RunReport> {
    // Set up signal handling. A first signal drains the run gracefully and
    // evaluates whatever was collected.
    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("received SIGINT, draining run");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, draining run");
            }
        }

        signal_cancel.cancel();
    });

    Runner::new(cfg).run(cancel).await
}
