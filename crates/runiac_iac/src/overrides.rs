//! Override files.
//!
//! A step may carry an `override/` directory whose files are copied into the
//! working directory before Terraform runs. Terraform merges any
//! `override.tf` / `*_override.tf` file over the step's configuration.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::IacResult;

/// Which lifecycle phase the overrides are for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverridePhase {
    Apply,
    Destroy,
}

impl OverridePhase {
    /// Candidate file names for a deployment ring, in copy order.
    pub fn file_names(&self, ring: &str) -> Vec<String> {
        match self {
            OverridePhase::Apply => vec![
                "override.tf".to_string(),
                format!("ring_{}_override.tf", ring),
            ],
            OverridePhase::Destroy => vec![
                "destroy_override.tf".to_string(),
                format!("destroy_ring_{}_override.tf", ring),
            ],
        }
    }
}

/// Copy the phase's override files present in `{dir}/override/` into `dir`.
///
/// Returns the copied destination paths.
pub fn apply_overrides(dir: &Path, ring: &str, phase: OverridePhase) -> IacResult<Vec<PathBuf>> {
    let source_dir = dir.join("override");
    let mut copied = Vec::new();
    if !source_dir.is_dir() {
        return Ok(copied);
    }

    for name in phase.file_names(ring) {
        let source = source_dir.join(&name);
        if !source.is_file() {
            continue;
        }
        let target = dir.join(&name);
        fs::copy(&source, &target)?;
        info!("Applied override {:?}", target);
        copied.push(target);
    }

    Ok(copied)
}
