use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use p2term::config::Config;
use p2term::terminal::Terminal;

/// Streaming debug terminal for Propeller 2 serial output.
#[derive(Parser)]
#[command(name = "p2term", about)]
struct Cli {
    /// Path to the YAML configuration file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides `log_level` from the config file.
    #[arg(long)]
    log_level: Option<String>,

    /// Byte source: "stdin", "file:<path>" or "tcp:<host:port>".
    /// Overrides `transport.source` from the config file.
    #[arg(short, long)]
    input: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via build.rs.
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

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("p2term {}", version::full());
        return Ok(());
    }

    let mut cfg = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };

    if let Some(input) = cli.input {
        cfg.transport.source = input;
    }
    if let Some(level) = cli.log_level {
        cfg.log_level = level;
    }
    cfg.validate().context("validating configuration")?;

    // Initialize tracing. Logs go to stderr; stdout carries the record log.
    let filter = EnvFilter::try_new(&cfg.log_level)
        .with_context(|| format!("invalid log level: {}", cfg.log_level))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting p2term",
    );

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    let result = rt.block_on(run(cfg));

    // A blocking stdin read cannot be interrupted; don't wait on it.
    rt.shutdown_timeout(Duration::from_secs(1));

    result
}

async fn run(cfg: Config) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("registering SIGTERM handler")?;

    // Start the terminal.
    let mut terminal = Terminal::new(cfg)?;
    terminal.start().await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
        _ = terminal.input_closed() => {
            tracing::info!("input finished, shutting down");
        }
    }

    // Graceful shutdown.
    if let Some(report) = terminal.stop().await? {
        if report.pending_discarded > 0 || report.backlog_discarded > 0 {
            tracing::warn!(
                pending = report.pending_discarded,
                backlog = report.backlog_discarded,
                "records discarded at shutdown"
            );
        }
    }

    tracing::info!("p2term stopped");

    Ok(())
}
