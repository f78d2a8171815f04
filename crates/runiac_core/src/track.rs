//! Track orchestration.
//!
//! A track is deployed primary region first, then every target region in
//! parallel when the track has regional steps. Destroy runs the other way
//! round. Each region is executed by a worker that walks the progression
//! levels in order, running the steps of a level concurrently.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use runiac_runner::{
    RegionDeployType, StepExecution, StepOutput, StepOutputVariables, StepStatus, StepTestOutput, Stepper,
};

use crate::config::Config;
use crate::discovery::{Step, Track};
use crate::error::{CoreError, CoreResult};
use crate::execution::{Direction, ExecutionOutput, Output, RegionExecution};
use crate::params::{load_step_parameters, ParameterStore};
use crate::status::{StepIdentity, StatusSink};

/// Outcome of one step inside a region worker.
struct StepRun {
    output: StepOutput,
    /// The execution handed to the runner, when it was invoked
    execution: Option<StepExecution>,
}

/// Runs tracks against a runner.
#[derive(Clone)]
pub struct TrackExecutor {
    config: Arc<Config>,
    stepper: Arc<dyn Stepper>,
    status: Arc<StatusSink>,
    params: Arc<dyn ParameterStore>,
}

impl TrackExecutor {
    pub fn new(
        config: Arc<Config>,
        stepper: Arc<dyn Stepper>,
        status: Arc<StatusSink>,
        params: Arc<dyn ParameterStore>,
    ) -> Self {
        Self {
            config,
            stepper,
            status,
            params,
        }
    }

    pub fn status(&self) -> &Arc<StatusSink> {
        &self.status
    }

    /// Deploy a track, seeding each region with the matching pretrack outputs.
    pub async fn deploy_track(&self, track: Arc<Track>, pretrack: Option<Arc<Output>>) -> Output {
        let primary_region = self.config.primary_region.clone();
        info!(track = track.name.as_str(), region = primary_region.as_str(), "Deploying track");

        let seed = pretrack
            .as_ref()
            .map(|p| p.pretrack_variables_for(RegionDeployType::Primary, &primary_region))
            .unwrap_or_default();
        let primary = self
            .run_region(RegionExecution {
                track: track.clone(),
                region: primary_region,
                region_deploy_type: RegionDeployType::Primary,
                direction: Direction::Deploy,
                default_step_output_variables: seed,
                primary_output: None,
            })
            .await;

        let mut output = Output::new(&track, Direction::Deploy);
        output.primary_step_output_variables = primary.step_output_variables.clone();

        if !track.has_regional_steps {
            output.executions.push(primary);
            self.status.flush_track(&track.name).await;
            return output;
        }

        let primary = Arc::new(primary);
        let regionals = self
            .config
            .target_regions
            .iter()
            .map(|region| {
                let mut seed = primary.step_output_variables.clone();
                if let Some(pretrack) = &pretrack {
                    seed.extend(pretrack.pretrack_variables_for(RegionDeployType::Regional, region));
                }
                RegionExecution {
                    track: track.clone(),
                    region: region.clone(),
                    region_deploy_type: RegionDeployType::Regional,
                    direction: Direction::Deploy,
                    default_step_output_variables: seed,
                    primary_output: Some(primary.clone()),
                }
            })
            .collect();
        let regional_outputs = self.run_regions(regionals).await;

        output.executions.push(Arc::try_unwrap(primary).unwrap_or_else(|shared| (*shared).clone()));
        output.executions.extend(regional_outputs);
        self.status.flush_track(&track.name).await;
        output
    }

    /// Destroy a track, regional regions first, each seeded with the
    /// variables its deploy captured.
    pub async fn destroy_track(&self, track: Arc<Track>, deployed: &Output) -> Output {
        info!(track = track.name.as_str(), "Destroying track");
        let mut output = Output::new(&track, Direction::Destroy);

        if track.has_regional_steps {
            let regionals = self
                .config
                .target_regions
                .iter()
                .map(|region| RegionExecution {
                    track: track.clone(),
                    region: region.clone(),
                    region_deploy_type: RegionDeployType::Regional,
                    direction: Direction::Destroy,
                    default_step_output_variables: deployed
                        .variables_for(RegionDeployType::Regional, region),
                    primary_output: None,
                })
                .collect();
            output.executions.extend(self.run_regions(regionals).await);
        }

        let primary_region = self.config.primary_region.clone();
        let primary = self
            .run_region(RegionExecution {
                track: track.clone(),
                default_step_output_variables: deployed
                    .variables_for(RegionDeployType::Primary, &primary_region),
                region: primary_region,
                region_deploy_type: RegionDeployType::Primary,
                direction: Direction::Destroy,
                primary_output: None,
            })
            .await;
        output.primary_step_output_variables = primary.step_output_variables.clone();
        output.executions.insert(0, primary);
        output
    }

    async fn run_region(&self, execution: RegionExecution) -> ExecutionOutput {
        let mut outputs = self.run_regions(vec![execution]).await;
        outputs.remove(0)
    }

    /// Run region workers concurrently and collect their outputs, ordered by region.
    ///
    /// Always returns one output per execution; a worker that died is
    /// reported as a failed region.
    async fn run_regions(&self, executions: Vec<RegionExecution>) -> Vec<ExecutionOutput> {
        let (tx, mut rx) = mpsc::channel::<ExecutionOutput>(executions.len().max(1));
        let mut pending: Vec<(Arc<Track>, String, RegionDeployType)> = Vec::new();

        for execution in executions {
            pending.push((
                execution.track.clone(),
                execution.region.clone(),
                execution.region_deploy_type,
            ));
            let worker = self.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let output = worker.execute_region(execution).await;
                if tx.send(output).await.is_err() {
                    error!("Region output receiver dropped");
                }
            });
        }
        drop(tx);

        let mut outputs = Vec::with_capacity(pending.len());
        while let Some(output) = rx.recv().await {
            outputs.push(output);
        }

        let returned: HashSet<(String, RegionDeployType)> = outputs
            .iter()
            .map(|o| (o.region.clone(), o.region_deploy_type))
            .collect();
        for (track, region, region_deploy_type) in pending {
            if !returned.contains(&(region.clone(), region_deploy_type)) {
                error!(
                    track = track.name.as_str(),
                    region = region.as_str(),
                    region_type = %region_deploy_type,
                    "Region worker aborted"
                );
                let mut lost = ExecutionOutput::new(&track, region, region_deploy_type);
                lost.failure_count += 1;
                lost.failed_steps.push("<worker aborted>".to_string());
                outputs.push(lost);
            }
        }

        outputs.sort_by(|a, b| a.region.cmp(&b.region));
        outputs
    }

    /// Region worker: walk the progression levels of one track in one region.
    async fn execute_region(&self, execution: RegionExecution) -> ExecutionOutput {
        let track = execution.track.clone();
        let region_deploy_type = execution.region_deploy_type;
        let mut output = ExecutionOutput::new(&track, &execution.region, region_deploy_type)
            .with_variables(execution.default_step_output_variables.clone());

        let levels: Vec<usize> = match execution.direction {
            Direction::Deploy => (1..=track.max_progression()).collect(),
            Direction::Destroy => (1..=track.max_progression()).rev().collect(),
        };

        let semaphore = Arc::new(Semaphore::new(track.test_count().max(1)));
        let mut tests: JoinSet<(String, StepIdentity, StepTestOutput)> = JoinSet::new();

        for (index, progression) in levels.into_iter().enumerate() {
            let steps = track.steps_at(progression);
            if steps.is_empty() {
                continue;
            }
            debug!(
                track = track.name.as_str(),
                region = execution.region.as_str(),
                progression,
                steps = steps.len(),
                "Starting progression"
            );

            let failures_before = output.failure_count;
            let variables = output.step_output_variables.clone();
            let runs = join_all(
                steps
                    .iter()
                    .map(|step| self.run_step(&execution, step, index > 0 && failures_before > 0, &variables)),
            )
            .await;

            for run in runs {
                let status = run.output.status;
                if execution.direction == Direction::Deploy && status.was_executed() {
                    output.merge_outputs(&run.output);
                }

                let step_name = run.output.step_name.clone();
                let testable = execution.direction == Direction::Deploy
                    && matches!(status, StepStatus::Success | StepStatus::Unstable);
                output.record(run.output);

                let Some(mut step_execution) = run.execution else {
                    continue;
                };
                let has_tests = steps
                    .iter()
                    .find(|s| s.name == step_name)
                    .map_or(false, |s| s.has_tests_for(region_deploy_type));
                if testable && has_tests {
                    step_execution.default_step_output_variables = output.step_output_variables.clone();
                    let identity = StepIdentity::from(&step_execution);
                    let stepper = self.stepper.clone();
                    let semaphore = semaphore.clone();
                    let span = info_span!(
                        "tests",
                        track = track.name.as_str(),
                        step = step_name.as_str(),
                        region = execution.region.as_str(),
                        region_type = %region_deploy_type
                    );
                    tests.spawn(
                        async move {
                            let _permit = semaphore.acquire_owned().await.ok();
                            info!("Running step tests");
                            let result = stepper.execute_step_tests(&step_execution).await;
                            (step_name, identity, result)
                        }
                        .instrument(span),
                    );
                }
            }
        }

        while let Some(joined) = tests.join_next().await {
            match joined {
                Ok((step_name, identity, result)) => {
                    if !result.passed() {
                        warn!(
                            step = step_name.as_str(),
                            region = identity.region.as_str(),
                            "Step tests failed: {}",
                            result.error.as_deref().unwrap_or_default()
                        );
                        self.status.record_step_test_fail(&identity, result.error.clone());
                    }
                    output.record_test(&step_name, result);
                }
                Err(e) => {
                    error!("Test task failed: {}", e);
                    output.failed_test_count += 1;
                }
            }
        }

        info!(
            track = track.name.as_str(),
            region = execution.region.as_str(),
            region_type = %region_deploy_type,
            direction = %execution.direction,
            executed = output.executed_count,
            failed = output.failure_count,
            skipped = output.skipped_count,
            "Region finished"
        );
        output
    }

    /// Classify and, when eligible, run one step.
    async fn run_step(
        &self,
        execution: &RegionExecution,
        step: &Step,
        earlier_level_failed: bool,
        variables: &StepOutputVariables,
    ) -> StepRun {
        let region_deploy_type = execution.region_deploy_type;
        let skipped = |status: StepStatus| StepRun {
            output: StepOutput::new(&step.name, &execution.region, region_deploy_type, status),
            execution: None,
        };

        if region_deploy_type == RegionDeployType::Regional && !step.has_regional {
            return skipped(StepStatus::NotApplicable);
        }
        if earlier_level_failed {
            info!(step = step.name.as_str(), region = execution.region.as_str(), "Skipping step after earlier failure");
            return skipped(StepStatus::Skipped);
        }
        if execution.primary_output.as_ref().map_or(false, |p| p.has_failures()) {
            info!(step = step.name.as_str(), region = execution.region.as_str(), "Skipping step, primary region failed");
            return skipped(StepStatus::Skipped);
        }

        let span = info_span!(
            "step",
            track = step.track_name.as_str(),
            step = step.name.as_str(),
            region = execution.region.as_str(),
            region_type = %region_deploy_type
        );
        self.invoke_runner(execution, step, variables).instrument(span).await
    }

    async fn invoke_runner(
        &self,
        execution: &RegionExecution,
        step: &Step,
        variables: &StepOutputVariables,
    ) -> StepRun {
        let deploying = execution.direction == Direction::Deploy;
        let identity = StepIdentity::new(
            &step.track_name,
            &step.name,
            execution.region_deploy_type,
            &execution.region,
        );

        let step_execution = match self.build_step_execution(execution, step, variables).await {
            Ok(e) => e,
            Err(e) => {
                error!("Step initialisation failed: {}", e);
                if deploying {
                    self.status.record_step_fail(&identity, Some(e.to_string()));
                }
                return StepRun {
                    output: StepOutput::new(&step.name, &execution.region, execution.region_deploy_type, StepStatus::Fail)
                        .with_error(e),
                    execution: None,
                };
            }
        };

        if deploying {
            self.status
                .record_step_start(&identity, self.config.dry_run, &self.config.target_regions)
                .await;
        }

        let step_execution = match self.stepper.pre_execute(step_execution).await {
            Ok(e) => e,
            Err(e) => {
                error!("Pre-execute failed: {}", e);
                if deploying {
                    self.status.record_step_fail(&identity, Some(e.to_string()));
                }
                return StepRun {
                    output: StepOutput::new(&step.name, &execution.region, execution.region_deploy_type, StepStatus::Fail)
                        .with_error(e),
                    execution: None,
                };
            }
        };

        info!(direction = %execution.direction, "Executing step");
        let output = match execution.direction {
            Direction::Deploy => self.stepper.execute_step(&step_execution).await,
            Direction::Destroy => self.stepper.execute_step_destroy(&step_execution).await,
        }
        .normalize();

        match output.status {
            StepStatus::Fail => {
                error!(error = output.error.as_deref().unwrap_or_default(), "Step failed");
                if deploying {
                    self.status.record_step_fail(&identity, output.error.clone());
                }
            }
            status => {
                info!(status = %status, outputs = output.output_variables.len(), "Step finished");
                if deploying {
                    self.status.record_step_success(&identity);
                }
            }
        }

        StepRun {
            output,
            execution: Some(step_execution),
        }
    }

    /// Working directory, parameters and injected variables for one step run.
    async fn build_step_execution(
        &self,
        execution: &RegionExecution,
        step: &Step,
        variables: &StepOutputVariables,
    ) -> CoreResult<StepExecution> {
        let config = &self.config;
        let dir = match execution.region_deploy_type {
            RegionDeployType::Primary => step.dir.clone(),
            RegionDeployType::Regional => {
                let source = step.regional_dir();
                let target = step.region_copy_dir(&execution.region);
                let copy_target = target.clone();
                tokio::task::spawn_blocking(move || copy_regional_dir(&source, &copy_target))
                    .await
                    .map_err(|e| CoreError::StepInit {
                        step: step.id.clone(),
                        message: e.to_string(),
                    })??;
                target
            }
        };

        let mut optional_params = load_step_parameters(
            self.params.as_ref(),
            &config.project,
            config.csp.as_str(),
            &config.deployment_ring,
            &step.track_name,
            &step.name,
        );
        for (step_key, vars) in variables {
            for (name, value) in vars {
                optional_params.insert(format!("{}-{}", step_key, name), value.clone());
            }
        }
        let mut core_accounts = config.core_accounts.clone();
        core_accounts.insert("target_account_id".to_string(), config.account_id.clone());
        optional_params.insert(
            "core_account_ids_map".to_string(),
            serde_json::to_string(&core_accounts)?,
        );

        let mut required_params = BTreeMap::new();
        for (name, value) in [
            ("runiac_target_account_id", config.account_id.as_str()),
            ("runiac_deployment_ring", config.deployment_ring.as_str()),
            ("runiac_project", config.project.as_str()),
            ("runiac_track", step.track_name.as_str()),
            ("runiac_step", step.name.as_str()),
            ("runiac_region_deploy_type", execution.region_deploy_type.as_str()),
            ("runiac_region_group", config.region_group.as_str()),
            ("runiac_primary_region", config.primary_region.as_str()),
            ("region", execution.region.as_str()),
            ("environment", config.environment.as_str()),
        ] {
            required_params.insert(name.to_string(), value.to_string());
        }

        Ok(StepExecution {
            execution_id: config.execution_id.clone(),
            project: config.project.clone(),
            track_name: step.track_name.clone(),
            step_name: step.name.clone(),
            step_id: step.id.clone(),
            region: execution.region.clone(),
            region_deploy_type: execution.region_deploy_type,
            dir,
            csp: config.csp.as_str().to_string(),
            environment: config.environment.clone(),
            account_id: config.account_id.clone(),
            core_accounts: config.core_accounts.clone(),
            namespace: config.namespace.clone(),
            deployment_ring: config.deployment_ring.clone(),
            region_group: config.region_group.clone(),
            primary_region: config.primary_region.clone(),
            dry_run: config.dry_run,
            self_destroy: config.self_destroy,
            max_retries: config.max_retries,
            max_test_retries: config.max_test_retries,
            retry_backoff: config.retry_backoff,
            junit_dir: config.junit_dir.clone(),
            required_params,
            optional_params,
            default_step_output_variables: variables.clone(),
        })
    }
}

/// Refresh `target` with the contents of `source`. Existing files in the
/// target that the source does not have (local state) are kept.
fn copy_regional_dir(source: &std::path::Path, target: &std::path::Path) -> CoreResult<()> {
    std::fs::create_dir_all(target)?;
    let options = fs_extra::dir::CopyOptions::new()
        .overwrite(true)
        .content_only(true);
    fs_extra::dir::copy(source, target, &options)?;
    debug!("Copied {:?} to {:?}", source, target);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_copy_regional_dir_keeps_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("regional");
        fs::create_dir_all(source.join("tests")).unwrap();
        fs::write(source.join("main.tf"), "v2").unwrap();
        fs::write(source.join("tests").join("tests.test"), "bin").unwrap();

        let target = dir.path().join("regional-us-east-1");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("main.tf"), "v1").unwrap();
        fs::write(target.join("terraform.tfstate"), "{}").unwrap();

        copy_regional_dir(&source, &target).unwrap();
        assert_eq!(fs::read_to_string(target.join("main.tf")).unwrap(), "v2");
        assert!(target.join("tests").join("tests.test").is_file());
        assert!(target.join("terraform.tfstate").is_file());
    }
}
