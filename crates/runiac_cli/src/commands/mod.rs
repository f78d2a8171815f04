//! CLI command definitions.
//!
//! Configuration comes from `RUNIAC_*` environment variables; flags here
//! only override a few of them.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use runiac_core::Config;

pub mod run;
pub mod tracks;

/// runiac - infrastructure-as-code track orchestrator
#[derive(Parser, Debug)]
#[command(name = "runiac")]
#[command(version, about = "runiac - deploy tracks of infrastructure-as-code steps")]
#[command(long_about = r#"
runiac deploys a directory of tracks. Each track holds steps named
step{N}_{name}; steps run in progression order, primary region first and
then every target region for steps with a regional/ directory.

COMMANDS:
  run     → Deploy every track (default), optionally destroying afterwards
  tracks  → List the tracks and steps that would run

Configuration is read from RUNIAC_* environment variables
(RUNIAC_CSP and RUNIAC_ENVIRONMENT are required).

EXIT CODES:
  0 - Success
  1 - Failed or skipped steps, or a general error
  2 - Invalid configuration
"#)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Directory containing the tracks
    #[arg(long, global = true, env = "RUNIAC_TRACKS_DIR")]
    pub tracks_dir: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long, global = true, env = "RUNIAC_JSON_LOGS")]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Deploy all tracks
    Run(run::RunArgs),

    /// List discovered tracks and steps
    Tracks(tracks::TracksArgs),
}

impl Default for Commands {
    fn default() -> Self {
        Commands::Run(run::RunArgs::default())
    }
}

/// Load configuration from the environment, apply flag overrides, then validate.
pub fn load_config(cli: &Cli, overrides: impl FnOnce(&mut Config)) -> Result<Config> {
    load_config_from(cli, |name| std::env::var(name).ok(), overrides)
}

/// [`load_config`] over an arbitrary variable lookup.
pub fn load_config_from<F>(cli: &Cli, lookup: F, overrides: impl FnOnce(&mut Config)) -> Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = Config::read_lookup(lookup).context("Failed to load configuration")?;
    if let Some(dir) = &cli.tracks_dir {
        config.tracks_dir = dir.clone();
    }
    overrides(&mut config);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_is_default_command() {
        let cli = Cli::try_parse_from(["runiac"]).unwrap();
        assert!(cli.command.is_none());
        assert!(matches!(cli.command.unwrap_or_default(), Commands::Run(_)));
    }

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::try_parse_from([
            "runiac",
            "--tracks-dir",
            "/work/tracks",
            "run",
            "--dry-run",
            "--terraform-bin",
            "/usr/local/bin/terraform",
        ])
        .unwrap();
        assert_eq!(cli.tracks_dir, Some(PathBuf::from("/work/tracks")));
        match cli.command {
            Some(Commands::Run(args)) => {
                assert!(args.dry_run);
                assert!(!args.self_destroy);
                assert_eq!(args.terraform_bin, "/usr/local/bin/terraform");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_tracks() {
        let cli = Cli::try_parse_from(["runiac", "tracks", "--json"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Tracks(args)) if args.json));
    }
}
