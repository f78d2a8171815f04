//! Track and step discovery.
//!
//! Layout under the tracks directory:
//!
//! ```text
//! tracks/
//!   _pretrack/
//!   {track}/
//!     runiac.yaml             optional { enabled: bool }
//!     step{N}_{name}/
//!       runiac.yaml
//!       tests/tests.test
//!       regional/
//!         tests/tests.test
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use runiac_runner::RegionDeployType;

use crate::config::Config;
use crate::error::{CoreError, CoreResult};

/// Directory name of the pretrack.
pub const PRETRACK_NAME: &str = "_pretrack";

const CONFIG_FILE: &str = "runiac.yaml";

fn step_dir_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^step(\d)_(.+)$").expect("valid regex"))
}

/// Per-track and per-step `runiac.yaml`.
#[derive(Debug, Clone, Deserialize)]
struct UnitConfig {
    #[serde(default = "enabled_by_default")]
    enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

fn is_enabled(dir: &Path) -> CoreResult<bool> {
    let path = dir.join(CONFIG_FILE);
    if !path.is_file() {
        return Ok(true);
    }
    let content = fs::read_to_string(&path)?;
    if content.trim().is_empty() {
        return Ok(true);
    }
    let config: UnitConfig = serde_yaml::from_str(&content)?;
    Ok(config.enabled)
}

fn has_test_binary(dir: &Path) -> bool {
    dir.join("tests").join("tests.test").is_file()
}

fn is_non_empty_dir(dir: &Path) -> bool {
    fs::read_dir(dir)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// One step of a track.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// `#{project}#{track}#{step}`
    pub id: String,
    pub name: String,
    pub track_name: String,
    pub dir: PathBuf,
    pub progression: usize,
    pub has_regional: bool,
    pub has_tests: bool,
    pub has_regional_tests: bool,
}

impl Step {
    pub fn regional_dir(&self) -> PathBuf {
        self.dir.join("regional")
    }

    /// Per-region working copy of `regional/`.
    pub fn region_copy_dir(&self, region: &str) -> PathBuf {
        self.dir.join(format!("regional-{}", region))
    }

    pub fn has_tests_for(&self, region_deploy_type: RegionDeployType) -> bool {
        match region_deploy_type {
            RegionDeployType::Primary => self.has_tests,
            RegionDeployType::Regional => self.has_regional_tests,
        }
    }
}

/// A discovered track, steps grouped by progression level.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub name: String,
    pub dir: PathBuf,
    /// Index `p - 1` holds progression `p`; levels may be empty
    pub progressions: Vec<Vec<Step>>,
    pub steps_count: usize,
    pub has_regional_steps: bool,
    pub is_pretrack: bool,
}

impl Track {
    pub fn max_progression(&self) -> usize {
        self.progressions.len()
    }

    /// Steps at progression `p` (1-based).
    pub fn steps_at(&self, progression: usize) -> &[Step] {
        progression
            .checked_sub(1)
            .and_then(|i| self.progressions.get(i))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.progressions.iter().flatten()
    }

    /// Number of test suites across primary and regional runs.
    pub fn test_count(&self) -> usize {
        self.steps()
            .map(|s| usize::from(s.has_tests) + usize::from(s.has_regional_tests))
            .sum()
    }
}

/// Discover all enabled tracks, sorted by name.
///
/// Problems with a single track or step are logged and that entry is
/// skipped. A missing tracks directory is an error.
pub fn discover(config: &Config) -> CoreResult<Vec<Track>> {
    let root = &config.tracks_dir;
    if !root.is_dir() {
        return Err(CoreError::Discovery {
            path: root.clone(),
            message: "tracks directory does not exist".to_string(),
        });
    }

    let mut dirs: Vec<PathBuf> = fs::read_dir(root)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
        .collect();
    dirs.sort();

    let mut tracks = Vec::new();
    for dir in dirs {
        match discover_track(&dir, config) {
            Ok(Some(track)) => {
                info!(
                    track = track.name.as_str(),
                    steps = track.steps_count,
                    regional = track.has_regional_steps,
                    "Discovered track"
                );
                tracks.push(track);
            }
            Ok(None) => {}
            Err(e) => warn!("Skipping track {:?}: {}", dir, e),
        }
    }

    Ok(tracks)
}

fn discover_track(dir: &Path, config: &Config) -> CoreResult<Option<Track>> {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| CoreError::Discovery {
            path: dir.to_path_buf(),
            message: "track directory has no name".to_string(),
        })?;

    if !is_enabled(dir)? {
        info!(track = name.as_str(), "Track disabled, skipping");
        return Ok(None);
    }

    let mut children: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_dir())
        .collect();
    children.sort();

    let mut progressions: Vec<Vec<Step>> = Vec::new();
    for child in children {
        match discover_step(&child, &name, config) {
            Ok(Some(step)) => {
                if progressions.len() < step.progression {
                    progressions.resize_with(step.progression, Vec::new);
                }
                progressions[step.progression - 1].push(step);
            }
            Ok(None) => {}
            Err(e) => warn!("Skipping step {:?}: {}", child, e),
        }
    }

    let steps_count: usize = progressions.iter().map(Vec::len).sum();
    if steps_count == 0 {
        debug!(track = name.as_str(), "Track has no steps, dropping");
        return Ok(None);
    }

    let has_regional_steps = progressions.iter().flatten().any(|s| s.has_regional);
    Ok(Some(Track {
        is_pretrack: name == PRETRACK_NAME,
        name,
        dir: dir.to_path_buf(),
        progressions,
        steps_count,
        has_regional_steps,
    }))
}

fn discover_step(dir: &Path, track_name: &str, config: &Config) -> CoreResult<Option<Step>> {
    let dir_name = match dir.file_name() {
        Some(name) => name.to_string_lossy().to_string(),
        None => return Ok(None),
    };
    let Some(caps) = step_dir_re().captures(&dir_name) else {
        return Ok(None);
    };

    let progression: usize = caps[1].parse().map_err(|_| CoreError::Discovery {
        path: dir.to_path_buf(),
        message: "invalid progression".to_string(),
    })?;
    if progression == 0 {
        warn!("Progression levels start at 1, ignoring {:?}", dir);
        return Ok(None);
    }
    let name = caps[2].to_string();

    if !is_enabled(dir)? {
        info!(track = track_name, step = name.as_str(), "Step disabled, skipping");
        return Ok(None);
    }

    let id = format!("#{}#{}#{}", config.project, track_name, name);
    if !config.is_step_targeted(&id) {
        debug!(step_id = id.as_str(), "Step not in whitelist, skipping");
        return Ok(None);
    }

    let regional = dir.join("regional");
    let has_regional = is_non_empty_dir(&regional);
    Ok(Some(Step {
        id,
        name,
        track_name: track_name.to_string(),
        dir: dir.to_path_buf(),
        progression,
        has_regional,
        has_tests: has_test_binary(dir),
        has_regional_tests: has_regional && has_test_binary(&regional),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_for(root: &Path, extra: &[(&str, &str)]) -> Config {
        let mut map: HashMap<String, String> = HashMap::new();
        map.insert("RUNIAC_CSP".into(), "AWS".into());
        map.insert("RUNIAC_ENVIRONMENT".into(), "prod".into());
        map.insert("RUNIAC_TRACKS_DIR".into(), root.to_string_lossy().to_string());
        for (k, v) in extra {
            map.insert(format!("RUNIAC_{}", k), v.to_string());
        }
        Config::from_lookup(|name| map.get(name).cloned()).unwrap()
    }

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "").unwrap();
    }

    #[test]
    fn test_discover_layout() {
        let root = tempfile::tempdir().unwrap();
        let core = root.path().join("core");
        touch(&core.join("step1_iam").join("main.tf"));
        touch(&core.join("step1_iam").join("tests").join("tests.test"));
        touch(&core.join("step2_dns").join("regional").join("main.tf"));
        touch(&core.join("step2_dns").join("regional").join("tests").join("tests.test"));
        touch(&core.join("step4_late").join("main.tf"));
        touch(&core.join("step0_bad").join("main.tf"));
        touch(&core.join("notastep").join("main.tf"));
        touch(&root.path().join("_pretrack").join("step1_base").join("main.tf"));

        let tracks = discover(&config_for(root.path(), &[])).unwrap();
        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].name, "_pretrack");
        assert!(tracks[0].is_pretrack);

        let core = &tracks[1];
        assert_eq!(core.steps_count, 3);
        assert_eq!(core.max_progression(), 4);
        assert!(core.steps_at(3).is_empty());
        assert!(core.has_regional_steps);
        assert_eq!(core.steps_at(1)[0].id, "#runiac#core#iam");
        assert!(core.steps_at(1)[0].has_tests);
        assert!(core.steps_at(2)[0].has_regional_tests);
        assert_eq!(core.test_count(), 2);
    }

    #[test]
    fn test_disabled_and_empty_tracks() {
        let root = tempfile::tempdir().unwrap();
        let off = root.path().join("off");
        touch(&off.join("step1_a").join("main.tf"));
        fs::write(off.join("runiac.yaml"), "enabled: false\n").unwrap();

        let partial = root.path().join("partial");
        touch(&partial.join("step1_a").join("main.tf"));
        touch(&partial.join("step1_b").join("main.tf"));
        fs::write(partial.join("step1_b").join("runiac.yaml"), "enabled: false\n").unwrap();

        fs::create_dir_all(root.path().join("empty").join("docs")).unwrap();

        let tracks = discover(&config_for(root.path(), &[])).unwrap();
        assert_eq!(tracks.len(), 1);
        assert_eq!(tracks[0].name, "partial");
        assert_eq!(tracks[0].steps_count, 1);
    }

    #[test]
    fn test_whitelist_filters_steps() {
        let root = tempfile::tempdir().unwrap();
        touch(&root.path().join("core").join("step1_iam").join("main.tf"));
        touch(&root.path().join("core").join("step1_dns").join("main.tf"));

        let config = config_for(
            root.path(),
            &[("TARGET_ALL", "false"), ("STEP_WHITELIST", "#runiac#core#dns")],
        );
        let tracks = discover(&config).unwrap();
        assert_eq!(tracks[0].steps().map(|s| s.name.as_str()).collect::<Vec<_>>(), vec!["dns"]);
    }

    #[test]
    fn test_empty_regional_dir_is_not_regional() {
        let root = tempfile::tempdir().unwrap();
        let step = root.path().join("core").join("step1_iam");
        touch(&step.join("main.tf"));
        fs::create_dir_all(step.join("regional")).unwrap();

        let tracks = discover(&config_for(root.path(), &[])).unwrap();
        assert!(!tracks[0].has_regional_steps);
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        let config = config_for(&root.path().join("nope"), &[]);
        assert!(matches!(discover(&config), Err(CoreError::Discovery { .. })));
    }
}
