//! rekey: operator command line for master encryption secret rotation

mod cli;
mod commands;
mod config;
mod state;

use clap::Parser;
use rekey_rotation::RotationError;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use crate::cli::Cli;
use crate::config::CliConfig;

/// Exit status when rollback left records divergent
const EXIT_DIVERGED: u8 = 2;

fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| anyhow::anyhow!("invalid log level '{level}': {e}"))?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match CliConfig::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = init_logging(&config.log_level) {
        eprintln!("error: {e:#}");
        return ExitCode::FAILURE;
    }

    match commands::run(cli.command, &config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            match e.downcast_ref::<RotationError>() {
                Some(RotationError::RollbackPartialFailure(_)) => ExitCode::from(EXIT_DIVERGED),
                _ => ExitCode::FAILURE,
            }
        }
    }
}
