use clap::Parser;
use pilot_agent::{agent::Agent, config::AgentConfig};
use std::{path::PathBuf, process::ExitCode};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "pilot-agent")]
#[command(version)]
#[command(about = "Runs the jobs queued for a pilot on its allocation")]
struct Cli {
    /// Coordination store URL, e.g. redis://password@host:6379 or memory://local
    coordination_url: String,

    /// Advertisement URL of the pilot, has to contain its `bj-` id
    pilot_url: String,

    /// YAML config file, defaults are used for everything not given
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, short)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let default_level = if cli.verbose { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_thread_names(true)
        .init();

    let mut config = match AgentConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(error) => {
            error!(error = ?error, "Failed to load config");
            return ExitCode::FAILURE;
        }
    };

    if config.preflight_checks() {
        error!("Config contains errors, aborting");
        return ExitCode::FAILURE;
    }

    let agent = match Agent::bootstrap(&cli.coordination_url, &cli.pilot_url, config) {
        Ok(agent) => agent,
        Err(error) => {
            error!(error = ?error, "Failed to bootstrap the agent");
            return ExitCode::FAILURE;
        }
    };

    match agent.run() {
        Ok(report) => {
            info!(
                dequeue = ?report.dequeue,
                monitor = ?report.monitor,
                "Agent terminated"
            );
            ExitCode::SUCCESS
        }
        Err(error) => {
            error!(error = ?error, "Agent failed");
            ExitCode::FAILURE
        }
    }
}
