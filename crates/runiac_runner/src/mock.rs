//! Mock stepper for testing.
//!
//! Provides a scripted implementation of the [`Stepper`] trait that records
//! every invocation, so orchestration can be verified without running any
//! IaC tool.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{RunnerError, RunnerResult};
use crate::output::{OutputValue, StepOutputVariables};
use crate::stepper::{RegionDeployType, StepExecution, StepOutput, StepStatus, StepTestOutput, Stepper};

/// Stepper method that was invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepMethod {
    PreExecute,
    Apply,
    Destroy,
    Tests,
}

/// Captured invocation for verification.
#[derive(Debug, Clone)]
pub struct CapturedCall {
    pub method: StepMethod,
    pub track: String,
    pub step: String,
    pub region_deploy_type: RegionDeployType,
    pub region: String,
    pub dir: PathBuf,
    pub optional_params: BTreeMap<String, String>,
    pub required_params: BTreeMap<String, String>,
    pub default_step_output_variables: StepOutputVariables,
}

/// Which executions a scripted behaviour applies to.
#[derive(Debug, Clone)]
struct Selector {
    step: String,
    region_deploy_type: Option<RegionDeployType>,
    region: Option<String>,
}

impl Selector {
    fn matches(&self, exec: &StepExecution) -> bool {
        self.step == exec.step_name
            && self.region_deploy_type.map_or(true, |t| t == exec.region_deploy_type)
            && self.region.as_deref().map_or(true, |r| r == exec.region)
    }
}

/// Scripted stepper that records every call.
#[derive(Clone, Default)]
pub struct MockStepper {
    calls: Arc<RwLock<Vec<CapturedCall>>>,
    apply_failures: Arc<RwLock<Vec<Selector>>>,
    destroy_failures: Arc<RwLock<Vec<Selector>>>,
    test_failures: Arc<RwLock<Vec<Selector>>>,
    pre_execute_failures: Arc<RwLock<Vec<String>>>,
    outputs: Arc<RwLock<HashMap<String, BTreeMap<String, OutputValue>>>>,
    scoped_outputs: Arc<RwLock<Vec<(Selector, String, OutputValue)>>>,
}

impl MockStepper {
    pub fn new() -> Self {
        Self::default()
    }

    fn selector(step: &str, region_deploy_type: Option<RegionDeployType>, region: Option<&str>) -> Selector {
        Selector {
            step: step.to_string(),
            region_deploy_type,
            region: region.map(str::to_string),
        }
    }

    /// Fail every apply of `step`.
    pub fn fail_step(self, step: &str) -> Self {
        self.apply_failures.write().push(Self::selector(step, None, None));
        self
    }

    /// Fail applies of `step` for one region type and region only.
    pub fn fail_step_in(self, step: &str, region_deploy_type: RegionDeployType, region: &str) -> Self {
        self.apply_failures
            .write()
            .push(Self::selector(step, Some(region_deploy_type), Some(region)));
        self
    }

    /// Fail every destroy of `step`.
    pub fn fail_destroy(self, step: &str) -> Self {
        self.destroy_failures.write().push(Self::selector(step, None, None));
        self
    }

    /// Fail every test run of `step`.
    pub fn fail_tests(self, step: &str) -> Self {
        self.test_failures.write().push(Self::selector(step, None, None));
        self
    }

    /// Make `pre_execute` return an error for `step`.
    pub fn fail_pre_execute(self, step: &str) -> Self {
        self.pre_execute_failures.write().push(step.to_string());
        self
    }

    /// Output variables returned by every successful apply of `step`.
    pub fn with_output(self, step: &str, name: &str, value: impl Into<OutputValue>) -> Self {
        self.outputs
            .write()
            .entry(step.to_string())
            .or_default()
            .insert(name.to_string(), value.into());
        self
    }

    /// Output variable returned by applies of `step` in one region type and
    /// region only, taking precedence over [`MockStepper::with_output`].
    pub fn with_output_in(
        self,
        step: &str,
        region_deploy_type: RegionDeployType,
        region: &str,
        name: &str,
        value: impl Into<OutputValue>,
    ) -> Self {
        self.scoped_outputs.write().push((
            Self::selector(step, Some(region_deploy_type), Some(region)),
            name.to_string(),
            value.into(),
        ));
        self
    }

    /// Get all captured calls, in invocation order.
    pub fn get_calls(&self) -> Vec<CapturedCall> {
        self.calls.read().clone()
    }

    /// Get calls to a specific method.
    pub fn get_method_calls(&self, method: StepMethod) -> Vec<CapturedCall> {
        self.calls
            .read()
            .iter()
            .filter(|c| c.method == method)
            .cloned()
            .collect()
    }

    /// Number of calls to a specific method.
    pub fn call_count(&self, method: StepMethod) -> usize {
        self.calls.read().iter().filter(|c| c.method == method).count()
    }

    /// Clear all captured calls.
    pub fn clear_calls(&self) {
        self.calls.write().clear();
    }

    fn record_call(&self, method: StepMethod, exec: &StepExecution) {
        self.calls.write().push(CapturedCall {
            method,
            track: exec.track_name.clone(),
            step: exec.step_name.clone(),
            region_deploy_type: exec.region_deploy_type,
            region: exec.region.clone(),
            dir: exec.dir.clone(),
            optional_params: exec.optional_params.clone(),
            required_params: exec.required_params.clone(),
            default_step_output_variables: exec.default_step_output_variables.clone(),
        });
    }

    fn matches_any(rules: &RwLock<Vec<Selector>>, exec: &StepExecution) -> bool {
        rules.read().iter().any(|s| s.matches(exec))
    }
}

#[async_trait]
impl Stepper for MockStepper {
    async fn pre_execute(&self, exec: StepExecution) -> RunnerResult<StepExecution> {
        self.record_call(StepMethod::PreExecute, &exec);
        if self.pre_execute_failures.read().contains(&exec.step_name) {
            return Err(RunnerError::PreExecuteFailed(format!(
                "simulated pre-execute failure for {}",
                exec.step_name
            )));
        }
        Ok(exec)
    }

    async fn execute_step(&self, exec: &StepExecution) -> StepOutput {
        self.record_call(StepMethod::Apply, exec);
        tokio::task::yield_now().await;

        if Self::matches_any(&self.apply_failures, exec) {
            return StepOutput::failed(exec, format!("simulated apply failure for {}", exec.step_name));
        }

        let mut output = StepOutput::for_execution(exec, StepStatus::Success);
        if let Some(vars) = self.outputs.read().get(&exec.step_name) {
            output.output_variables = vars.clone();
        }
        for (selector, name, value) in self.scoped_outputs.read().iter() {
            if selector.matches(exec) {
                output.output_variables.insert(name.clone(), value.clone());
            }
        }
        output
    }

    async fn execute_step_destroy(&self, exec: &StepExecution) -> StepOutput {
        self.record_call(StepMethod::Destroy, exec);
        tokio::task::yield_now().await;

        if Self::matches_any(&self.destroy_failures, exec) {
            return StepOutput::failed(exec, format!("simulated destroy failure for {}", exec.step_name));
        }
        StepOutput::success(exec)
    }

    async fn execute_step_tests(&self, exec: &StepExecution) -> StepTestOutput {
        self.record_call(StepMethod::Tests, exec);

        if Self::matches_any(&self.test_failures, exec) {
            return StepTestOutput {
                stream_output: "--- FAIL".to_string(),
                error: Some(format!("simulated test failure for {}", exec.step_name)),
            };
        }
        StepTestOutput {
            stream_output: "PASS".to_string(),
            error: None,
        }
    }
}
