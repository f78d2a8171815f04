//! Terraform runner.
//!
//! Implements the [`Stepper`] contract by driving the `terraform` CLI in the
//! step's working directory.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, info, warn};

use runiac_runner::{
    retry, CredentialsProvider, OutputValue, RunnerError, RunnerResult, ShellCommand,
    StepExecution, StepOutput, StepTestOutput, Stepper, VERBOSE_MAX_BUFFER,
};

use crate::backend::resolve_backend;
use crate::error::{IacError, IacResult};
use crate::junit;
use crate::overrides::{apply_overrides, OverridePhase};
use crate::variables::{declared_variables, tf_var_env};

const PLAN_FILE: &str = "runiac.tfplan";

/// Entry of `terraform output -json`.
#[derive(Debug, Deserialize)]
struct TerraformOutput {
    value: serde_json::Value,
    #[serde(default)]
    sensitive: bool,
}

/// Parse `terraform output -json` into output variables.
pub fn parse_outputs(json: &str) -> IacResult<BTreeMap<String, OutputValue>> {
    let trimmed = json.trim();
    if trimmed.is_empty() {
        return Ok(BTreeMap::new());
    }

    let outputs: BTreeMap<String, TerraformOutput> = serde_json::from_str(trimmed)?;
    Ok(outputs
        .into_iter()
        .map(|(name, output)| {
            if output.sensitive {
                debug!(output = name.as_str(), "Sensitive output captured");
            }
            (name, OutputValue::from(output.value))
        })
        .collect())
}

/// Terraform implementation of the runner contract.
pub struct TerraformStepper {
    binary: String,
    credentials: Arc<dyn CredentialsProvider>,
}

impl TerraformStepper {
    /// Create a new Terraform runner.
    pub fn new(credentials: Arc<dyn CredentialsProvider>) -> Self {
        Self {
            binary: "terraform".to_string(),
            credentials,
        }
    }

    /// Use a specific Terraform binary.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Subprocess environment: credentials, automation flags and declared variables.
    async fn environment(&self, exec: &StepExecution) -> IacResult<HashMap<String, String>> {
        let mut env = self.credentials.environment(&exec.account_id, &exec.region).await?;
        env.insert("TF_IN_AUTOMATION".to_string(), "1".to_string());
        env.insert("TF_INPUT".to_string(), "0".to_string());

        let declared = declared_variables(&exec.dir)?;
        env.extend(tf_var_env(&exec.all_params(), &declared));
        Ok(env)
    }

    fn command(&self, exec: &StepExecution, env: &HashMap<String, String>) -> ShellCommand {
        ShellCommand::new(&self.binary)
            .dir(&exec.dir)
            .envs(env.clone())
            .max_buffer(VERBOSE_MAX_BUFFER)
    }

    /// Run terraform init against the resolved backend.
    async fn init(&self, exec: &StepExecution, env: &HashMap<String, String>) -> IacResult<String> {
        let backend = resolve_backend(exec)?;
        info!(backend = %backend.kind, "Running terraform init in {:?}", exec.dir);

        self.command(exec, env)
            .args(["init", "-input=false", "-no-color", "-reconfigure"])
            .args(backend.to_init_args())
            .run_capture_and_stream()
            .await
            .map_err(|e| IacError::InitFailed(e.to_string()))
    }

    /// Run terraform plan, writing the plan file.
    async fn plan(&self, exec: &StepExecution, env: &HashMap<String, String>, destroy: bool) -> IacResult<String> {
        info!(destroy, "Running terraform plan in {:?}", exec.dir);

        let mut cmd = self
            .command(exec, env)
            .args(["plan", "-input=false", "-no-color"])
            .arg(format!("-out={}", PLAN_FILE));
        if destroy {
            cmd = cmd.arg("-destroy");
        }
        cmd.run_capture_and_stream()
            .await
            .map_err(|e| IacError::PlanFailed(e.to_string()))
    }

    /// Apply the saved plan.
    async fn apply(&self, exec: &StepExecution, env: &HashMap<String, String>) -> IacResult<String> {
        info!("Running terraform apply in {:?}", exec.dir);

        self.command(exec, env)
            .args(["apply", "-input=false", "-no-color", "-auto-approve", PLAN_FILE])
            .run_capture_and_stream()
            .await
            .map_err(|e| IacError::ApplyFailed(e.to_string()))
    }

    /// Read the step's outputs.
    async fn outputs(&self, exec: &StepExecution, env: &HashMap<String, String>) -> IacResult<BTreeMap<String, OutputValue>> {
        let json = self
            .command(exec, env)
            .args(["output", "-json", "-no-color"])
            .run_and_capture_stdout()
            .await
            .map_err(|e| IacError::OutputFailed(e.to_string()))?;
        parse_outputs(&json)
    }

    /// One attempt of init + plan + (unless dry-run) apply.
    async fn plan_and_apply(
        &self,
        exec: &StepExecution,
        env: &HashMap<String, String>,
        destroy: bool,
    ) -> IacResult<String> {
        let mut transcript = self.init(exec, env).await?;
        transcript.push('\n');
        transcript.push_str(&self.plan(exec, env, destroy).await?);

        if exec.dry_run {
            info!("Dry run, skipping terraform apply");
            return Ok(transcript);
        }

        transcript.push('\n');
        transcript.push_str(&self.apply(exec, env).await?);
        Ok(transcript)
    }

    /// Plan-and-apply under the execution's retry policy.
    ///
    /// Returns the transcript of the last attempt alongside the outcome.
    async fn run_lifecycle(
        &self,
        exec: &StepExecution,
        env: &HashMap<String, String>,
        destroy: bool,
    ) -> (String, IacResult<()>) {
        let transcript = Mutex::new(String::new());
        let description = if destroy {
            format!("terraform destroy {}", exec.step_name)
        } else {
            format!("terraform plan and apply {}", exec.step_name)
        };

        let result = {
            let transcript = &transcript;
            retry(&description, exec.max_retries, exec.retry_backoff, move |attempt| async move {
                debug!(attempt, "Terraform attempt");
                match self.plan_and_apply(exec, env, destroy).await {
                    Ok(output) => {
                        *transcript.lock() = output;
                        Ok(())
                    }
                    Err(e) => {
                        if let IacError::InitFailed(ref msg)
                        | IacError::PlanFailed(ref msg)
                        | IacError::ApplyFailed(ref msg) = e
                        {
                            *transcript.lock() = msg.clone();
                        }
                        Err(e)
                    }
                }
            })
            .await
        };

        (transcript.into_inner(), result.map_err(IacError::from))
    }
}

#[async_trait]
impl Stepper for TerraformStepper {
    async fn pre_execute(&self, exec: StepExecution) -> RunnerResult<StepExecution> {
        apply_overrides(&exec.dir, &exec.deployment_ring, OverridePhase::Apply)
            .map_err(|e| RunnerError::PreExecuteFailed(e.to_string()))?;
        Ok(exec)
    }

    async fn execute_step(&self, exec: &StepExecution) -> StepOutput {
        let env = match self.environment(exec).await {
            Ok(env) => env,
            Err(e) => return StepOutput::failed(exec, e),
        };

        let (transcript, result) = self.run_lifecycle(exec, &env, false).await;
        if let Err(e) = result {
            return StepOutput::failed(exec, e).with_stream_output(transcript);
        }

        let output = StepOutput::success(exec).with_stream_output(transcript);
        if exec.dry_run {
            return output;
        }

        match self.outputs(exec, &env).await {
            Ok(vars) => {
                info!(count = vars.len(), "Captured step outputs");
                StepOutput {
                    output_variables: vars,
                    ..output
                }
            }
            Err(e) => output.with_error(e),
        }
    }

    async fn execute_step_destroy(&self, exec: &StepExecution) -> StepOutput {
        if let Err(e) = apply_overrides(&exec.dir, &exec.deployment_ring, OverridePhase::Destroy) {
            return StepOutput::failed(exec, e);
        }
        let env = match self.environment(exec).await {
            Ok(env) => env,
            Err(e) => return StepOutput::failed(exec, e),
        };

        let (transcript, result) = self.run_lifecycle(exec, &env, true).await;
        match result {
            Ok(()) => StepOutput::success(exec).with_stream_output(transcript),
            Err(e) => StepOutput::failed(exec, e).with_stream_output(transcript),
        }
    }

    async fn execute_step_tests(&self, exec: &StepExecution) -> StepTestOutput {
        let binary = exec.test_binary();
        if !binary.is_file() {
            debug!("No test binary at {:?}", binary);
            return StepTestOutput::default();
        }

        let mut env: HashMap<String, String> = exec
            .all_params()
            .into_iter()
            .map(|(name, value)| (format!("TF_VAR_{}", name), value))
            .collect();
        match serde_json::to_string(&exec.default_step_output_variables) {
            Ok(json) => {
                env.insert("RUNIAC_STEP_OUTPUT_VARIABLES".to_string(), json);
            }
            Err(e) => warn!("Could not serialise step outputs for tests: {}", e),
        }

        let started = Instant::now();
        let transcript = Mutex::new(String::new());
        let result = {
            let transcript = &transcript;
            let env = &env;
            let binary = &binary;
            retry(
                &format!("tests for {}", exec.step_name),
                exec.max_test_retries,
                exec.retry_backoff,
                move |_| async move {
                    let result = ShellCommand::new(binary.to_string_lossy())
                        .dir(exec.tests_dir())
                        .arg("-test.v")
                        .envs(env.clone())
                        .max_buffer(VERBOSE_MAX_BUFFER)
                        .run_capture_and_stream()
                        .await;
                    match result {
                        Ok(output) => {
                            *transcript.lock() = output;
                            Ok(())
                        }
                        Err(e) => {
                            if let runiac_runner::ShellError::NonZeroExit { ref output, .. } = e {
                                *transcript.lock() = output.clone();
                            }
                            Err(e)
                        }
                    }
                },
            )
            .await
        };

        let output = StepTestOutput {
            stream_output: transcript.into_inner(),
            error: result.err().map(|e| e.to_string()),
        };

        let suite = format!(
            "{}-{}-{}-{}-{}",
            exec.project, exec.track_name, exec.step_name, exec.region_deploy_type, exec.region
        );
        if let Err(e) = junit::write_report(&exec.junit_path(), &suite, &output, started.elapsed()) {
            warn!("Failed to write JUnit report {:?}: {}", exec.junit_path(), e);
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_outputs() {
        let json = json!({
            "vpc_id": {"sensitive": false, "type": "string", "value": "vpc-123"},
            "subnets": {"sensitive": false, "type": ["list", "string"], "value": ["a", "b"]},
            "password": {"sensitive": true, "type": "string", "value": "secret"}
        })
        .to_string();

        let outputs = parse_outputs(&json).unwrap();
        assert_eq!(outputs.len(), 3);
        assert_eq!(outputs["vpc_id"], OutputValue::from("vpc-123"));
        assert_eq!(outputs["subnets"].to_param_string(), r#"["a","b"]"#);
    }

    #[test]
    fn test_parse_empty_outputs() {
        assert!(parse_outputs("").unwrap().is_empty());
        assert!(parse_outputs("{}\n").unwrap().is_empty());
    }
}
