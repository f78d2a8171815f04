//! runiac CLI - Main entry point.
//!
//! Exit codes:
//! - 0: Success
//! - 1: Run failed (failed, skipped or undestroyed steps) or general error
//! - 2: Invalid configuration

use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

use commands::{Cli, Commands};

/// CI-friendly exit codes
pub struct ExitCodes;

impl ExitCodes {
    pub const SUCCESS: u8 = 0;
    pub const FAILURE: u8 = 1;
    pub const INVALID_CONFIG: u8 = 2;
}

fn init_logging(cli: &Cli) {
    let level = std::env::var("RUNIAC_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);
    let log_result = if cli.json_logs {
        registry.with(fmt::layer().json().with_target(false)).try_init()
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()
    };

    if log_result.is_err() {
        // Logging already initialized, continue
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli);

    let result = match cli.command.clone().unwrap_or_default() {
        Commands::Run(args) => commands::run::execute(&cli, args).await,
        Commands::Tracks(args) => commands::tracks::execute(&cli, args).await,
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            let exit_code = categorize_error(&e);
            tracing::error!("{:#}", e);
            ExitCode::from(exit_code)
        }
    }
}

/// Configuration problems get their own exit code.
fn categorize_error(e: &anyhow::Error) -> u8 {
    match e.downcast_ref::<runiac_core::CoreError>() {
        Some(runiac_core::CoreError::Config(_)) => ExitCodes::INVALID_CONFIG,
        _ => ExitCodes::FAILURE,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_errors_exit_with_two() {
        let err = anyhow::Error::new(runiac_core::CoreError::Config("bad".to_string()))
            .context("Failed to load configuration");
        assert_eq!(categorize_error(&err), ExitCodes::INVALID_CONFIG);

        let err = anyhow::anyhow!("track task failed");
        assert_eq!(categorize_error(&err), ExitCodes::FAILURE);
    }
}
