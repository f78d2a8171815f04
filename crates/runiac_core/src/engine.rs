//! Run engine.
//!
//! Runs the pretrack alone, then every other track in parallel, then
//! optionally tears everything down again.

use std::sync::Arc;

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use runiac_runner::Stepper;

use crate::config::Config;
use crate::discovery::{discover, Track};
use crate::error::{CoreError, CoreResult};
use crate::execution::{Direction, Output};
use crate::params::{EmptyParameterStore, ParameterStore};
use crate::status::{StatusReporter, StatusSink};
use crate::track::TrackExecutor;

/// Overall run result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryResult {
    Success,
    Fail,
}

impl SummaryResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryResult::Success => "success",
            SummaryResult::Fail => "fail",
        }
    }
}

impl std::fmt::Display for SummaryResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Aggregate counts for a whole run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub result: SummaryResult,
    /// Executed steps that did not fail
    pub executed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub failed_tests: usize,
    pub failed_destroys: usize,
    pub message: String,
}

impl Summary {
    pub fn is_success(&self) -> bool {
        self.result == SummaryResult::Success
    }

    /// Process exit code for this summary.
    pub fn exit_code(&self) -> i32 {
        match self.result {
            SummaryResult::Success => 0,
            SummaryResult::Fail => 1,
        }
    }

    /// Emit the summary as one structured event.
    pub fn emit(&self) {
        info!(
            r#type = "summary",
            result = self.result.as_str(),
            executed = self.executed,
            failed = self.failed,
            skipped = self.skipped,
            failed_tests = self.failed_tests,
            "{}",
            self.message
        );
    }
}

/// Everything a run produced.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stage {
    pub pretrack: Option<Output>,
    pub tracks: Vec<Output>,
    pub destroyed: Vec<Output>,
    pub pretrack_failed: bool,
}

impl Stage {
    /// Deploy outputs, pretrack first.
    pub fn deploy_outputs(&self) -> impl Iterator<Item = &Output> {
        self.pretrack.iter().chain(self.tracks.iter())
    }

    pub fn track(&self, name: &str) -> Option<&Output> {
        self.deploy_outputs().find(|o| o.name == name)
    }

    pub fn summary(&self) -> Summary {
        let executed_total: usize = self.deploy_outputs().map(Output::executed_count).sum();
        let deploy_failed: usize = self.deploy_outputs().map(Output::failure_count).sum();
        let failed_destroys: usize = self.destroyed.iter().map(Output::failure_count).sum();
        let skipped: usize = self.deploy_outputs().map(Output::skipped_count).sum();
        let failed_tests: usize = self.deploy_outputs().map(Output::failed_test_count).sum();

        let failed = deploy_failed + failed_destroys;
        let executed = executed_total.saturating_sub(deploy_failed);
        let result = if failed > 0 || skipped > 0 {
            SummaryResult::Fail
        } else {
            SummaryResult::Success
        };

        let mut message = format!(
            "Run {}: {} step(s) executed, {} failed, {} skipped, {} failed test(s)",
            result, executed, failed, skipped, failed_tests
        );
        if failed_destroys > 0 {
            message.push_str(&format!(", {} failed destroy(s)", failed_destroys));
        }
        if self.pretrack_failed {
            message.push_str(", pretrack failed");
        }

        Summary {
            result,
            executed,
            failed,
            skipped,
            failed_tests,
            failed_destroys,
            message,
        }
    }
}

/// Orchestrates a full run.
pub struct Engine {
    config: Arc<Config>,
    stepper: Arc<dyn Stepper>,
    reporter: Option<Arc<dyn StatusReporter>>,
    params: Arc<dyn ParameterStore>,
}

impl Engine {
    pub fn new(config: Config, stepper: Arc<dyn Stepper>) -> Self {
        Self {
            config: Arc::new(config),
            stepper,
            reporter: None,
            params: Arc::new(EmptyParameterStore),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn StatusReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    pub fn with_parameter_store(mut self, params: Arc<dyn ParameterStore>) -> Self {
        self.params = params;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn executor(&self) -> TrackExecutor {
        let mut sink = StatusSink::new(
            &self.config.execution_id,
            &self.config.project,
            self.config.csp.as_str(),
        );
        if let Some(reporter) = &self.reporter {
            sink = sink.with_reporter(reporter.clone());
        }
        TrackExecutor::new(
            self.config.clone(),
            self.stepper.clone(),
            Arc::new(sink),
            self.params.clone(),
        )
    }

    /// Discover tracks under the configured directory and run them.
    pub async fn run(&self) -> CoreResult<Stage> {
        let tracks = discover(&self.config)?;
        self.run_tracks(tracks).await
    }

    /// Run already discovered tracks.
    pub async fn run_tracks(&self, tracks: Vec<Track>) -> CoreResult<Stage> {
        let executor = self.executor();
        let (pretracks, tracks): (Vec<Track>, Vec<Track>) =
            tracks.into_iter().partition(|t| t.is_pretrack);
        let pretrack = pretracks.into_iter().next().map(Arc::new);
        let tracks: Vec<Arc<Track>> = tracks.into_iter().map(Arc::new).collect();

        info!(
            execution_id = self.config.execution_id.as_str(),
            tracks = tracks.len(),
            pretrack = pretrack.is_some(),
            dry_run = self.config.dry_run,
            "Starting run"
        );

        let mut stage = Stage::default();

        let pretrack_output = match &pretrack {
            Some(track) => {
                let output = executor.deploy_track(track.clone(), None).await;
                if output.has_failures() {
                    error!(track = track.name.as_str(), "Pretrack failed, skipping remaining tracks");
                    stage.pretrack_failed = true;
                    stage.tracks = tracks
                        .iter()
                        .map(|t| Output::skipped(t, Direction::Deploy))
                        .collect();
                    stage.pretrack = Some(output);
                    return Ok(stage);
                }
                Some(Arc::new(output))
            }
            None => None,
        };

        let deploys = tracks.iter().map(|track| {
            let executor = executor.clone();
            let track = track.clone();
            let pretrack = pretrack_output.clone();
            tokio::spawn(async move { executor.deploy_track(track, pretrack).await })
        });
        stage.tracks = collect_outputs(join_all(deploys).await)?;

        if self.config.self_destroy && !self.config.dry_run {
            info!("Self destroy enabled, tearing down");
            let destroys = tracks.iter().zip(stage.tracks.iter()).map(|(track, deployed)| {
                let executor = executor.clone();
                let track = track.clone();
                let deployed = deployed.clone();
                tokio::spawn(async move { executor.destroy_track(track, &deployed).await })
            });
            stage.destroyed = collect_outputs(join_all(destroys).await)?;

            if let (Some(track), Some(deployed)) = (&pretrack, &pretrack_output) {
                let output = executor.destroy_track(track.clone(), deployed).await;
                stage.destroyed.push(output);
            }
        }

        stage.pretrack = pretrack_output.map(|o| Arc::try_unwrap(o).unwrap_or_else(|shared| (*shared).clone()));
        if executor.status().pending() > 0 {
            warn!(pending = executor.status().pending(), "Unflushed step statuses left after run");
        }
        Ok(stage)
    }
}

fn collect_outputs(joined: Vec<Result<Output, tokio::task::JoinError>>) -> CoreResult<Vec<Output>> {
    joined
        .into_iter()
        .map(|result| {
            result.map_err(|e| CoreError::Task(format!("track task failed: {}", e)))
        })
        .collect()
}
