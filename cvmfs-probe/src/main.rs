use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use tokio::signal;

use cvmfs_probe::probe::ProbeEngine;
use cvmfs_probe::scheduler::{self, Scheduler};
use cvmfs_probe::settings::Settings;
use cvmfs_probe::telemetry::{self, LogSink, MetricSink};

#[derive(Debug, Parser)]
struct Opt {
    /// Probe configuration file (YAML)
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Verbose output
    #[clap(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(if opt.verbose { "info" } else { "warn" }),
    )
    .init();

    let settings = Settings::new(opt.config.as_deref()).context("Failed to load settings")?;

    let sink: Arc<dyn MetricSink> = match telemetry::init_metrics()? {
        Some(otlp) => Arc::new(otlp),
        None => Arc::new(LogSink),
    };

    let scheduler = Scheduler::new(
        ProbeEngine::new(),
        sink,
        Duration::from_secs(settings.interval),
    );

    for (index, block) in settings.probes.iter().enumerate() {
        scheduler
            .configure(&block.directives)
            .with_context(|| format!("Invalid probe configuration block {index}"))?;
    }

    info!("Monitoring active. Press Ctrl-C to exit.");
    signal::ctrl_c().await?;
    info!("Exiting...");

    scheduler::request_shutdown();
    scheduler.shutdown();
    telemetry::shutdown_metrics();

    Ok(())
}
