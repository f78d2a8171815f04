//! Run command - Deploy every track and report the summary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;
use tracing::info;

use runiac_core::{Config, Engine, TracingReporter, YamlParameterStore};
use runiac_iac::TerraformStepper;
use runiac_runner::{AmbientCredentials, RunnerKind, Stepper};

use super::{load_config, Cli};
use crate::ExitCodes;

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Plan only; never apply or destroy
    #[arg(long)]
    pub dry_run: bool,

    /// Destroy every track after a successful deploy
    #[arg(long)]
    pub self_destroy: bool,

    /// Terraform binary to run
    #[arg(long, env = "RUNIAC_TERRAFORM_BIN", default_value = "terraform")]
    pub terraform_bin: String,

    /// Also write the summary as JSON to this file
    #[arg(long)]
    pub summary_file: Option<PathBuf>,
}

impl Default for RunArgs {
    fn default() -> Self {
        Self {
            dry_run: false,
            self_destroy: false,
            terraform_bin: std::env::var("RUNIAC_TERRAFORM_BIN").unwrap_or_else(|_| "terraform".to_string()),
            summary_file: None,
        }
    }
}

impl RunArgs {
    /// Layer the run flags over the environment configuration.
    pub fn apply_to(&self, config: &mut Config) {
        if self.dry_run {
            config.dry_run = true;
        }
        if self.self_destroy {
            config.self_destroy = true;
        }
    }
}

pub async fn execute(cli: &Cli, args: RunArgs) -> Result<u8> {
    let config = load_config(cli, |config| args.apply_to(config))?;

    info!(
        execution_id = config.execution_id.as_str(),
        project = config.project.as_str(),
        environment = config.environment.as_str(),
        csp = %config.csp,
        runner = %config.runner,
        dry_run = config.dry_run,
        self_destroy = config.self_destroy,
        "Starting runiac {}",
        config.version
    );

    let stepper: Arc<dyn Stepper> = match config.runner {
        RunnerKind::Terraform => Arc::new(
            TerraformStepper::new(Arc::new(AmbientCredentials)).with_binary(args.terraform_bin.clone()),
        ),
    };

    let mut engine = Engine::new(config.clone(), stepper);
    if let Some(path) = &config.parameters_file {
        let store = YamlParameterStore::from_file(path)
            .with_context(|| format!("Failed to load parameters from {:?}", path))?;
        engine = engine.with_parameter_store(Arc::new(store));
    }
    if config.status_reporting {
        engine = engine.with_reporter(Arc::new(TracingReporter));
    }

    let stage = engine.run().await.context("Run failed")?;
    let summary = stage.summary();
    summary.emit();

    if let Some(path) = &args.summary_file {
        let json = serde_json::to_string_pretty(&summary)?;
        std::fs::write(path, json).with_context(|| format!("Failed to write summary to {:?}", path))?;
    }

    Ok(u8::try_from(summary.exit_code()).unwrap_or(ExitCodes::FAILURE))
}
