//! Tracks command - Show what a run would execute.

use anyhow::{Context, Result};
use clap::Args;

use runiac_core::{discover, Track};

use super::{load_config, Cli};
use crate::ExitCodes;

#[derive(Args, Debug, Clone, Default)]
pub struct TracksArgs {
    /// Print the discovered tracks as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(cli: &Cli, args: TracksArgs) -> Result<u8> {
    let config = load_config(cli, |_| {})?;
    let tracks = discover(&config).context("Failed to discover tracks")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&tracks)?);
    } else {
        print!("{}", render(&tracks));
    }
    Ok(ExitCodes::SUCCESS)
}

/// Human-readable listing, one line per track and per step.
fn render(tracks: &[Track]) -> String {
    if tracks.is_empty() {
        return "No tracks found\n".to_string();
    }

    let mut out = String::new();
    for track in tracks {
        let kind = if track.is_pretrack { " [pretrack]" } else { "" };
        out.push_str(&format!("{}{} ({} steps)\n", track.name, kind, track.steps_count));
        for step in track.steps() {
            let mut flags = Vec::new();
            if step.has_regional {
                flags.push("regional");
            }
            if step.has_tests {
                flags.push("tests");
            }
            if step.has_regional_tests {
                flags.push("regional-tests");
            }
            out.push_str(&format!("  {} {}", step.progression, step.name));
            if !flags.is_empty() {
                out.push_str(&format!(" ({})", flags.join(", ")));
            }
            out.push('\n');
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use runiac_core::Step;
    use std::path::PathBuf;

    fn step(name: &str, progression: usize, has_regional: bool) -> Step {
        Step {
            id: format!("#runiac#core#{}", name),
            name: name.to_string(),
            track_name: "core".to_string(),
            dir: PathBuf::from(format!("tracks/core/step{}_{}", progression, name)),
            progression,
            has_regional,
            has_tests: true,
            has_regional_tests: false,
        }
    }

    #[test]
    fn test_render_tracks() {
        let track = Track {
            name: "core".to_string(),
            dir: PathBuf::from("tracks/core"),
            progressions: vec![vec![step("iam", 1, false)], vec![step("dns", 2, true)]],
            steps_count: 2,
            has_regional_steps: true,
            is_pretrack: false,
        };
        let text = render(&[track]);
        assert_eq!(
            text,
            "core (2 steps)\n  1 iam (tests)\n  2 dns (regional, tests)\n"
        );
    }

    #[test]
    fn test_render_empty() {
        assert_eq!(render(&[]), "No tracks found\n");
    }
}
