use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use humantime::parse_duration;

use subject_cache::config::Config;
use subject_cache::logging::ensure_log_error;

mod logging;
mod stresstest;
mod workloads;

use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

/// Command line interface parser.
#[derive(Parser)]
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

    /// Print all logs to the console, as configured in the configuration file.
    ///
    /// By default, logs are formatted but discarded.
    #[arg(long, short)]
    verbose: bool,

    /// Report metrics to a local statsd sink.
    #[arg(long)]
    metrics: bool,
}

fn main() {
    match execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}

fn execute() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    let config = Config::get(cli.config.as_deref())?;

    // SAFETY: We are still single-threaded, the runtime is only started below.
    let mut logging_guard = unsafe {
        logging::init(logging::Config {
            backtraces: config.logging.enable_backtraces,
            sentry_dsn: config.sentry_dsn.clone(),
            verbose: cli.verbose,
            metrics: cli.metrics,
            service_config: &config,
        })?
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("subject-stress")
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    if let Some(udp_sink) = logging_guard.udp_sink.take() {
        runtime.spawn(udp_sink);
    }

    runtime.block_on(perform_stresstest(config, workloads, cli.duration))
}
