//! Results of executing tracks.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use runiac_runner::{
    stringify_outputs, RegionDeployType, StepOutput, StepOutputVariables, StepStatus, StepTestOutput,
};

use crate::discovery::Track;

/// Prefix for pretrack outputs seen by other tracks.
pub const PRETRACK_PREFIX: &str = "pretrack-";

/// Whether a track is being deployed or torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Deploy,
    Destroy,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Deploy => "deploy",
            Direction::Destroy => "destroy",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Work order for one region worker.
#[derive(Debug, Clone)]
pub struct RegionExecution {
    pub track: Arc<Track>,
    pub region: String,
    pub region_deploy_type: RegionDeployType,
    pub direction: Direction,
    /// Starting variables; the worker owns and extends its copy
    pub default_step_output_variables: StepOutputVariables,
    /// Primary result, for regional skip decisions
    pub primary_output: Option<Arc<ExecutionOutput>>,
}

/// A step's run and test results within one region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub output: StepOutput,
    pub test_output: Option<StepTestOutput>,
}

/// Results of one track in one region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub track_name: String,
    pub track_dir: PathBuf,
    pub region: String,
    pub region_deploy_type: RegionDeployType,
    pub steps: BTreeMap<String, StepResult>,
    pub failed_steps: Vec<String>,
    pub executed_count: usize,
    pub skipped_count: usize,
    pub failure_count: usize,
    pub failed_test_count: usize,
    pub step_output_variables: StepOutputVariables,
}

impl ExecutionOutput {
    pub fn new(track: &Track, region: impl Into<String>, region_deploy_type: RegionDeployType) -> Self {
        Self {
            track_name: track.name.clone(),
            track_dir: track.dir.clone(),
            region: region.into(),
            region_deploy_type,
            steps: BTreeMap::new(),
            failed_steps: Vec::new(),
            executed_count: 0,
            skipped_count: 0,
            failure_count: 0,
            failed_test_count: 0,
            step_output_variables: StepOutputVariables::new(),
        }
    }

    pub fn with_variables(mut self, variables: StepOutputVariables) -> Self {
        self.step_output_variables = variables;
        self
    }

    /// Count a step result.
    pub fn record(&mut self, output: StepOutput) {
        match output.status {
            StepStatus::Success | StepStatus::Unstable => self.executed_count += 1,
            StepStatus::Fail => {
                self.executed_count += 1;
                self.failure_count += 1;
                self.failed_steps.push(output.step_name.clone());
            }
            StepStatus::Skipped => self.skipped_count += 1,
            StepStatus::NotApplicable => {}
        }
        self.steps.insert(
            output.step_name.clone(),
            StepResult {
                output,
                test_output: None,
            },
        );
    }

    /// Store a step's outputs under its key for later progressions.
    pub fn merge_outputs(&mut self, output: &StepOutput) {
        let key = self.region_deploy_type.output_key(&output.step_name);
        self.step_output_variables
            .insert(key, stringify_outputs(&output.output_variables));
    }

    /// Attach a finished test run to its step.
    pub fn record_test(&mut self, step_name: &str, test_output: StepTestOutput) {
        if !test_output.passed() {
            self.failed_test_count += 1;
        }
        if let Some(result) = self.steps.get_mut(step_name) {
            result.test_output = Some(test_output);
        }
    }

    /// Status of a step in this region, if it was considered.
    pub fn status_of(&self, step_name: &str) -> Option<StepStatus> {
        self.steps.get(step_name).map(|r| r.output.status)
    }

    pub fn has_failures(&self) -> bool {
        self.failure_count > 0
    }
}

/// Results of one track in one direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Output {
    pub name: String,
    pub direction: Direction,
    /// Primary first, then regional executions ordered by region
    pub executions: Vec<ExecutionOutput>,
    pub primary_step_output_variables: StepOutputVariables,
    /// Set when the track never ran because the pretrack failed
    pub skipped: bool,
    pub steps_count: usize,
}

impl Output {
    pub fn new(track: &Track, direction: Direction) -> Self {
        Self {
            name: track.name.clone(),
            direction,
            executions: Vec::new(),
            primary_step_output_variables: StepOutputVariables::new(),
            skipped: false,
            steps_count: track.steps_count,
        }
    }

    /// Output for a track that was not run.
    pub fn skipped(track: &Track, direction: Direction) -> Self {
        Self {
            skipped: true,
            ..Self::new(track, direction)
        }
    }

    pub fn execution_for(&self, region_deploy_type: RegionDeployType, region: &str) -> Option<&ExecutionOutput> {
        self.executions
            .iter()
            .find(|e| e.region_deploy_type == region_deploy_type && e.region == region)
    }

    pub fn primary(&self) -> Option<&ExecutionOutput> {
        self.executions
            .iter()
            .find(|e| e.region_deploy_type == RegionDeployType::Primary)
    }

    pub fn regional(&self) -> impl Iterator<Item = &ExecutionOutput> {
        self.executions
            .iter()
            .filter(|e| e.region_deploy_type == RegionDeployType::Regional)
    }

    /// Variables captured for `(region type, region)`, empty if that region never ran.
    pub fn variables_for(&self, region_deploy_type: RegionDeployType, region: &str) -> StepOutputVariables {
        self.execution_for(region_deploy_type, region)
            .map(|e| e.step_output_variables.clone())
            .unwrap_or_default()
    }

    /// This (pretrack) output's own variables for a consumer in the same
    /// `(region type, region)`, keyed `pretrack-{key}`.
    ///
    /// Entries a regional execution inherited from its primary are left out.
    pub fn pretrack_variables_for(&self, region_deploy_type: RegionDeployType, region: &str) -> StepOutputVariables {
        let Some(execution) = self.execution_for(region_deploy_type, region) else {
            return StepOutputVariables::new();
        };
        execution
            .steps
            .keys()
            .map(|step| region_deploy_type.output_key(step))
            .filter_map(|key| {
                execution
                    .step_output_variables
                    .get(&key)
                    .map(|vars| (format!("{}{}", PRETRACK_PREFIX, key), vars.clone()))
            })
            .collect()
    }

    pub fn executed_count(&self) -> usize {
        self.executions.iter().map(|e| e.executed_count).sum()
    }

    pub fn failure_count(&self) -> usize {
        self.executions.iter().map(|e| e.failure_count).sum()
    }

    /// Step-region skips, or every step when the whole track was skipped.
    pub fn skipped_count(&self) -> usize {
        if self.skipped {
            return self.steps_count;
        }
        self.executions.iter().map(|e| e.skipped_count).sum()
    }

    pub fn failed_test_count(&self) -> usize {
        self.executions.iter().map(|e| e.failed_test_count).sum()
    }

    pub fn has_failures(&self) -> bool {
        self.failure_count() > 0
    }
}
