use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use resource_cache::config::Config;
use resource_cache::{logging, metrics};

use crate::stresstest::perform_stresstest;
use crate::workloads::WorkloadsConfig;

mod stresstest;
mod workloads;

/// Command line interface parser.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = humantime::parse_duration)]
    duration: Duration,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    let config = Config::get(cli.config.as_deref()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        traces_sample_rate: 1.0,
        ..Default::default()
    });

    logging::init_logging(&config);
    if let Err(err) = metrics::configure(&config.metrics) {
        logging::ensure_log_error(&err);
    }

    perform_stresstest(config, workloads, cli.duration).await
}
