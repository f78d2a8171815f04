//! The runner contract and the values passed across it.
//!
//! An IaC backend implements [`Stepper`]. The engine hands it one
//! [`StepExecution`] per (step, region, region type) and classifies the step
//! from the returned [`StepOutput`].

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RunnerError, RunnerResult};
use crate::output::{OutputValue, StepOutputVariables};

/// Which flavour of region a step is executed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegionDeployType {
    /// The region group's designated primary region, once per track.
    Primary,
    /// Every requested target region, from the step's `regional/` directory.
    Regional,
}

impl RegionDeployType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegionDeployType::Primary => "primary",
            RegionDeployType::Regional => "regional",
        }
    }

    /// Key under which a step's outputs are stored in the region's variable map.
    pub fn output_key(&self, step_name: &str) -> String {
        match self {
            RegionDeployType::Primary => step_name.to_string(),
            RegionDeployType::Regional => format!("{}-regional", step_name),
        }
    }
}

impl std::fmt::Display for RegionDeployType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Classification of one step run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Success,
    Fail,
    Unstable,
    Skipped,
    NotApplicable,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Success => "success",
            StepStatus::Fail => "fail",
            StepStatus::Unstable => "unstable",
            StepStatus::Skipped => "skipped",
            StepStatus::NotApplicable => "not_applicable",
        }
    }

    /// Whether the runner was actually invoked for this result.
    pub fn was_executed(&self) -> bool {
        !matches!(self, StepStatus::Skipped | StepStatus::NotApplicable)
    }
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Fully resolved plan for one step in one region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepExecution {
    pub execution_id: String,
    pub project: String,
    pub track_name: String,
    pub step_name: String,
    /// `#{project}#{track}#{step}`
    pub step_id: String,
    pub region: String,
    pub region_deploy_type: RegionDeployType,
    /// Working directory; a per-region copy of `regional/` for regional runs
    pub dir: PathBuf,
    pub csp: String,
    pub environment: String,
    pub account_id: String,
    pub core_accounts: BTreeMap<String, String>,
    pub namespace: String,
    pub deployment_ring: String,
    pub region_group: String,
    pub primary_region: String,
    pub dry_run: bool,
    pub self_destroy: bool,
    pub max_retries: u32,
    pub max_test_retries: u32,
    pub retry_backoff: Duration,
    pub junit_dir: PathBuf,
    /// Engine-injected variables
    pub required_params: BTreeMap<String, String>,
    /// Parameter store values, previous step outputs and core accounts
    pub optional_params: BTreeMap<String, String>,
    pub default_step_output_variables: StepOutputVariables,
}

impl StepExecution {
    /// Every parameter the runner should pass to the tool; required ones win.
    pub fn all_params(&self) -> BTreeMap<String, String> {
        let mut params = self.optional_params.clone();
        params.extend(self.required_params.clone());
        params
    }

    pub fn tests_dir(&self) -> PathBuf {
        self.dir.join("tests")
    }

    pub fn test_binary(&self) -> PathBuf {
        self.tests_dir().join("tests.test")
    }

    /// Location of the JUnit report for this execution.
    pub fn junit_path(&self) -> PathBuf {
        self.junit_dir.join(format!(
            "{}-{}-{}-{}-{}.xml",
            self.project, self.track_name, self.step_name, self.region_deploy_type, self.region
        ))
    }
}

/// Result of applying or destroying one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutput {
    pub status: StepStatus,
    pub region_deploy_type: RegionDeployType,
    pub region: String,
    pub step_name: String,
    pub stream_output: String,
    pub error: Option<String>,
    pub output_variables: BTreeMap<String, OutputValue>,
    pub finished_at: DateTime<Utc>,
}

impl StepOutput {
    pub fn new(
        step_name: impl Into<String>,
        region: impl Into<String>,
        region_deploy_type: RegionDeployType,
        status: StepStatus,
    ) -> Self {
        Self {
            status,
            region_deploy_type,
            region: region.into(),
            step_name: step_name.into(),
            stream_output: String::new(),
            error: None,
            output_variables: BTreeMap::new(),
            finished_at: Utc::now(),
        }
    }

    /// Output bound to an execution's identity.
    pub fn for_execution(exec: &StepExecution, status: StepStatus) -> Self {
        Self::new(&exec.step_name, &exec.region, exec.region_deploy_type, status)
    }

    pub fn success(exec: &StepExecution) -> Self {
        Self::for_execution(exec, StepStatus::Success)
    }

    pub fn failed(exec: &StepExecution, error: impl std::fmt::Display) -> Self {
        Self::for_execution(exec, StepStatus::Fail).with_error(error)
    }

    pub fn with_error(mut self, error: impl std::fmt::Display) -> Self {
        self.error = Some(error.to_string());
        self.status = StepStatus::Fail;
        self
    }

    pub fn with_stream_output(mut self, output: impl Into<String>) -> Self {
        self.stream_output = output.into();
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, value: impl Into<OutputValue>) -> Self {
        self.output_variables.insert(name.into(), value.into());
        self
    }

    /// An error always classifies the step as failed.
    pub fn normalize(mut self) -> Self {
        if self.error.is_some() {
            self.status = StepStatus::Fail;
        }
        self
    }
}

/// Result of running a step's tests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepTestOutput {
    pub stream_output: String,
    pub error: Option<String>,
}

impl StepTestOutput {
    pub fn passed(&self) -> bool {
        self.error.is_none()
    }
}

/// An IaC backend.
#[async_trait]
pub trait Stepper: Send + Sync {
    /// Adjust the execution before it runs (override files, directory layout).
    /// An error is fatal to the step.
    async fn pre_execute(&self, exec: StepExecution) -> RunnerResult<StepExecution>;

    /// Apply the step.
    async fn execute_step(&self, exec: &StepExecution) -> StepOutput;

    /// Tear the step down.
    async fn execute_step_destroy(&self, exec: &StepExecution) -> StepOutput;

    /// Run the step's tests from its `tests/` directory.
    async fn execute_step_tests(&self, exec: &StepExecution) -> StepTestOutput;
}

/// Available runner backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunnerKind {
    #[default]
    Terraform,
}

impl RunnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunnerKind::Terraform => "terraform",
        }
    }
}

impl FromStr for RunnerKind {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "terraform" | "" => Ok(RunnerKind::Terraform),
            other => Err(RunnerError::InvalidConfiguration(format!(
                "unknown runner '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for RunnerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_key_suffixes_regional() {
        assert_eq!(RegionDeployType::Primary.output_key("iam"), "iam");
        assert_eq!(RegionDeployType::Regional.output_key("iam"), "iam-regional");
    }

    #[test]
    fn test_normalize_forces_fail_on_error() {
        let mut output = StepOutput::new("iam", "us-east-1", RegionDeployType::Primary, StepStatus::Success);
        output.error = Some("boom".to_string());
        assert_eq!(output.normalize().status, StepStatus::Fail);
    }

    #[test]
    fn test_runner_kind_parse() {
        assert_eq!("Terraform".parse::<RunnerKind>().unwrap(), RunnerKind::Terraform);
        assert!("arm".parse::<RunnerKind>().is_err());
    }

    #[test]
    fn test_was_executed() {
        assert!(StepStatus::Fail.was_executed());
        assert!(!StepStatus::Skipped.was_executed());
        assert!(!StepStatus::NotApplicable.was_executed());
    }
}
