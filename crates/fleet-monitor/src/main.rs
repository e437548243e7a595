use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use fleet_core::config::Config;
use fleet_core::layout::ProjectLayout;
use fleet_monitor::monitor::{CompletionMonitor, MonitorSettings, RunOutcome};
use fleet_monitor::shutdown::{DryRunShutdown, HostShutdown, ShutdownAction, ShutdownSignal};
use fleet_monitor::status::{default_status_path, StatusFile};
use tracing::{error, info};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Exit code when stopped by ctrl-c before work finished.
const EXIT_INTERRUPTED: u8 = 130;

/// Watch project roots and shut the host down once every task is finished.
#[derive(Debug, Parser)]
#[command(name = "fleet-monitor", version)]
struct Args {
    /// Project roots to watch.
    #[arg(required = true)]
    roots: Vec<PathBuf>,

    /// Seconds between the shutdown request and the host going down.
    #[arg(long)]
    delay_secs: Option<u64>,

    /// Seconds between polls.
    #[arg(long)]
    interval_secs: Option<u64>,

    /// Where to write the monitor status file.
    #[arg(long)]
    status_file: Option<PathBuf>,

    /// Log the shutdown instead of performing it.
    #[arg(long)]
    dry_run: bool,

    /// Config file (defaults to ~/.fleet/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(RunOutcome::Shutdown) => ExitCode::SUCCESS,
        Ok(RunOutcome::Interrupted) => ExitCode::from(EXIT_INTERRUPTED),
        Err(e) => {
            error!(error = %format!("{e:#}"), "monitor stopped abnormally");
            eprintln!("fleet-monitor: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<RunOutcome> {
    let config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().context("failed to load config")?,
    };
    fleet_telemetry::logging::init(
        "fleet-monitor",
        &config.general.log_level,
        fleet_telemetry::logging::LogFormat::from_config(&config.general.log_format),
    );

    let mut settings = MonitorSettings::from(&config.monitor);
    if let Some(secs) = args.delay_secs {
        settings.shutdown_delay = Duration::from_secs(secs);
    }
    if let Some(secs) = args.interval_secs {
        settings.poll_interval = Duration::from_secs(secs.max(1));
    }

    let mut roots = Vec::with_capacity(args.roots.len());
    for root in &args.roots {
        let root = root
            .canonicalize()
            .with_context(|| format!("project root {} is not accessible", root.display()))?;
        roots.push(ProjectLayout::with_data_dir(root, config.layout.data_dir.clone()));
    }

    let status_path = args
        .status_file
        .clone()
        .unwrap_or_else(|| default_status_path(&roots));
    let mut status = StatusFile::new(status_path);
    info!(path = %status.path().display(), "monitor status file");

    let action: Box<dyn ShutdownAction> = if args.dry_run {
        Box::new(DryRunShutdown::new())
    } else {
        Box::new(HostShutdown)
    };

    let signal = ShutdownSignal::new();
    signal.install_ctrl_c();

    let mut monitor = CompletionMonitor::new(roots, settings).context("invalid monitor setup")?;
    let outcome = monitor
        .run(action.as_ref(), &signal, Some(&mut status))
        .await
        .context("completion monitor failed")?;
    info!(?outcome, "completion monitor finished");
    Ok(outcome)
}
