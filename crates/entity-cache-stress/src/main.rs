use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use humantime::parse_duration;

use entity_cache::{Config, logging, metrics};

mod stresstest;
mod workloads;

use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

/// Runs concurrent workloads against an entity cache backed by an in-memory store.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = parse_duration)]
    duration: Duration,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;
    workloads.validate()?;
    let config = Config::get(cli.config.as_deref()).context("failed loading config")?;

    // SAFETY: The runtime is not started yet, so this is still single-threaded.
    unsafe { logging::init_logging(&config) };
    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd,
            config.metrics.custom_tags.clone(),
        )?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("entity-cache-stress")
        .enable_all()
        .build()
        .context("failed to start runtime")?;

    let result = runtime.block_on(perform_stresstest(config, workloads, cli.duration));
    if let Err(ref error) = result {
        logging::ensure_log_error(error);
    }
    result
}
