//! Step status collection and per-track regional reporting.
//!
//! Region workers record step results as they finish. When a track is done
//! the orchestrator flushes it: entries are grouped per step deployment,
//! aggregated across regions and handed to the optional [`StatusReporter`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use runiac_runner::{RegionDeployType, StepExecution};

use crate::error::CoreResult;

/// Deployment phase reported with every regional status.
pub const REGIONAL_POST_DEPLOY: &str = "REGIONALPOSTDEPLOY";

/// Identity of one step run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepIdentity {
    pub track: String,
    pub step: String,
    pub region_deploy_type: RegionDeployType,
    pub region: String,
}

impl StepIdentity {
    pub fn new(
        track: impl Into<String>,
        step: impl Into<String>,
        region_deploy_type: RegionDeployType,
        region: impl Into<String>,
    ) -> Self {
        Self {
            track: track.into(),
            step: step.into(),
            region_deploy_type,
            region: region.into(),
        }
    }

    /// `#{track}#{step}#{regionType}#{region}`
    pub fn key(&self) -> String {
        format!(
            "#{}#{}#{}#{}",
            self.track, self.step, self.region_deploy_type, self.region
        )
    }
}

impl From<&StepExecution> for StepIdentity {
    fn from(exec: &StepExecution) -> Self {
        Self::new(&exec.track_name, &exec.step_name, exec.region_deploy_type, &exec.region)
    }
}

/// Result of one entry in the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryResult {
    InProgress,
    Success,
    Fail,
    Unstable,
}

/// Status of one step in one region.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusEntry {
    pub result: EntryResult,
    pub step: String,
    pub region: String,
    pub region_deploy_type: RegionDeployType,
    pub step_deployment_id: String,
    pub target_regions: Vec<String>,
    pub error: Option<String>,
}

/// Aggregate result across regions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RegionalResult {
    Success,
    Fail,
    Unstable,
}

/// Payload sent to the reporter for one step deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateRegionalStatus {
    pub account_step_deployment_id: String,
    pub failed_regions: Vec<String>,
    pub target_regions: Vec<String>,
    pub deployment_phase: String,
    pub csp: String,
    pub result: RegionalResult,
    pub result_message: String,
}

/// Payload sent when a primary step run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepStarted {
    pub account_step_deployment_id: String,
    pub track: String,
    pub step: String,
    pub region: String,
    pub target_regions: Vec<String>,
    pub csp: String,
}

/// External destination for status updates.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn step_started(&self, event: StepStarted) -> CoreResult<()>;

    async fn update_regional_status(&self, status: UpdateRegionalStatus) -> CoreResult<()>;
}

/// Reporter that writes each update as a structured log event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

#[async_trait]
impl StatusReporter for TracingReporter {
    async fn step_started(&self, event: StepStarted) -> CoreResult<()> {
        info!(
            r#type = "step_started",
            step_deployment_id = event.account_step_deployment_id.as_str(),
            region = event.region.as_str(),
            "Step started"
        );
        Ok(())
    }

    async fn update_regional_status(&self, status: UpdateRegionalStatus) -> CoreResult<()> {
        let payload = serde_json::to_string(&status)?;
        info!(
            r#type = "regional_status",
            step_deployment_id = status.account_step_deployment_id.as_str(),
            result = ?status.result,
            payload = payload.as_str(),
            "{}",
            status.result_message
        );
        Ok(())
    }
}

/// Shared, lock-protected collection of step statuses.
pub struct StatusSink {
    execution_id: String,
    project: String,
    csp: String,
    reporter: Option<Arc<dyn StatusReporter>>,
    entries: Mutex<BTreeMap<String, StatusEntry>>,
}

impl StatusSink {
    pub fn new(execution_id: impl Into<String>, project: impl Into<String>, csp: impl Into<String>) -> Self {
        Self {
            execution_id: execution_id.into(),
            project: project.into(),
            csp: csp.into(),
            reporter: None,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn StatusReporter>) -> Self {
        self.reporter = Some(reporter);
        self
    }

    /// `{executionId}#{project}#{track}#{step}`
    pub fn step_deployment_id(&self, track: &str, step: &str) -> String {
        format!("{}#{}#{}#{}", self.execution_id, self.project, track, step)
    }

    /// Insert an in-progress entry and report the start of primary runs.
    pub async fn record_step_start(&self, identity: &StepIdentity, dry_run: bool, target_regions: &[String]) {
        let step_deployment_id = self.step_deployment_id(&identity.track, &identity.step);
        self.entries.lock().insert(
            identity.key(),
            StatusEntry {
                result: EntryResult::InProgress,
                step: identity.step.clone(),
                region: identity.region.clone(),
                region_deploy_type: identity.region_deploy_type,
                step_deployment_id: step_deployment_id.clone(),
                target_regions: target_regions.to_vec(),
                error: None,
            },
        );

        if identity.region_deploy_type != RegionDeployType::Primary || dry_run {
            return;
        }
        if let Some(reporter) = &self.reporter {
            let event = StepStarted {
                account_step_deployment_id: step_deployment_id,
                track: identity.track.clone(),
                step: identity.step.clone(),
                region: identity.region.clone(),
                target_regions: target_regions.to_vec(),
                csp: self.csp.clone(),
            };
            if let Err(e) = reporter.step_started(event).await {
                warn!(step = identity.step.as_str(), "Failed to report step start: {}", e);
            }
        }
    }

    pub fn record_step_success(&self, identity: &StepIdentity) {
        self.upsert(identity, EntryResult::Success, None);
    }

    pub fn record_step_fail(&self, identity: &StepIdentity, error: Option<String>) {
        self.upsert(identity, EntryResult::Fail, error);
    }

    pub fn record_step_test_fail(&self, identity: &StepIdentity, error: Option<String>) {
        self.upsert(identity, EntryResult::Unstable, error);
    }

    fn upsert(&self, identity: &StepIdentity, result: EntryResult, error: Option<String>) {
        let mut entries = self.entries.lock();
        let entry = entries.entry(identity.key()).or_insert_with(|| StatusEntry {
            result,
            step: identity.step.clone(),
            region: identity.region.clone(),
            region_deploy_type: identity.region_deploy_type,
            step_deployment_id: self.step_deployment_id(&identity.track, &identity.step),
            target_regions: Vec::new(),
            error: None,
        });
        entry.result = result;
        if error.is_some() {
            entry.error = error;
        }
    }

    /// Number of entries not yet flushed.
    pub fn pending(&self) -> usize {
        self.entries.lock().len()
    }

    /// Drain the track's entries, aggregate them per step deployment and
    /// report each aggregate. Reporter failures are logged only.
    pub async fn flush_track(&self, track: &str) -> BTreeMap<String, UpdateRegionalStatus> {
        let prefix = format!("#{}#", track);
        let drained: Vec<StatusEntry> = {
            let mut entries = self.entries.lock();
            let keys: Vec<String> = entries
                .range(prefix.clone()..)
                .take_while(|(key, _)| key.starts_with(&prefix))
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|key| entries.remove(key)).collect()
        };

        let mut grouped: BTreeMap<String, Vec<StatusEntry>> = BTreeMap::new();
        for entry in drained {
            grouped.entry(entry.step_deployment_id.clone()).or_default().push(entry);
        }

        let statuses: BTreeMap<String, UpdateRegionalStatus> = grouped
            .into_iter()
            .map(|(id, entries)| {
                let status = self.aggregate(&id, &entries);
                (id, status)
            })
            .collect();
        debug!(track, count = statuses.len(), "Flushed track statuses");

        if let Some(reporter) = &self.reporter {
            for status in statuses.values() {
                if let Err(e) = reporter.update_regional_status(status.clone()).await {
                    warn!(
                        step_deployment_id = status.account_step_deployment_id.as_str(),
                        "Failed to report regional status: {}",
                        e
                    );
                }
            }
        }

        statuses
    }

    fn aggregate(&self, step_deployment_id: &str, entries: &[StatusEntry]) -> UpdateRegionalStatus {
        let region_label = |e: &StatusEntry| format!("{}/{}", e.region_deploy_type, e.region);
        let failed_regions: Vec<String> = entries
            .iter()
            .filter(|e| e.result == EntryResult::Fail)
            .map(region_label)
            .collect();
        let succeeded: Vec<String> = entries
            .iter()
            .filter(|e| e.result != EntryResult::Fail)
            .map(region_label)
            .collect();
        let target_regions = entries
            .iter()
            .map(|e| &e.target_regions)
            .max_by_key(|t| t.len())
            .cloned()
            .unwrap_or_default();

        let failed = failed_regions.len();
        let result = if failed > 0 && failed >= target_regions.len() {
            RegionalResult::Fail
        } else if failed > 0 || entries.iter().any(|e| e.result == EntryResult::Unstable) {
            RegionalResult::Unstable
        } else {
            RegionalResult::Success
        };

        let step = entries.first().map(|e| e.step.as_str()).unwrap_or_default();
        let result_message = if failed_regions.is_empty() {
            format!(
                "Step {} succeeded in {} region(s): {}",
                step,
                succeeded.len(),
                succeeded.join(", ")
            )
        } else {
            format!(
                "Step {} failed in: {}; succeeded in: {}",
                step,
                failed_regions.join(", "),
                if succeeded.is_empty() {
                    "none".to_string()
                } else {
                    succeeded.join(", ")
                }
            )
        };

        UpdateRegionalStatus {
            account_step_deployment_id: step_deployment_id.to_string(),
            failed_regions,
            target_regions,
            deployment_phase: REGIONAL_POST_DEPLOY.to_string(),
            csp: self.csp.clone(),
            result,
            result_message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets() -> Vec<String> {
        vec!["us-east-1".to_string(), "us-east-2".to_string()]
    }

    async fn record(sink: &StatusSink, identity: &StepIdentity, result: EntryResult) {
        sink.record_step_start(identity, false, &targets()).await;
        match result {
            EntryResult::Success => sink.record_step_success(identity),
            EntryResult::Fail => sink.record_step_fail(identity, Some("boom".to_string())),
            EntryResult::Unstable => sink.record_step_test_fail(identity, None),
            EntryResult::InProgress => {}
        }
    }

    #[tokio::test]
    async fn test_key_format() {
        let identity = StepIdentity::new("core", "iam", RegionDeployType::Regional, "us-east-2");
        assert_eq!(identity.key(), "#core#iam#regional#us-east-2");
        let sink = StatusSink::new("exec-1", "runiac", "AWS");
        assert_eq!(sink.step_deployment_id("core", "iam"), "exec-1#runiac#core#iam");
    }

    #[tokio::test]
    async fn test_one_failed_regional_is_unstable() {
        let sink = StatusSink::new("exec-1", "runiac", "AWS");
        record(&sink, &StepIdentity::new("core", "iam", RegionDeployType::Primary, "us-east-1"), EntryResult::Success).await;
        record(&sink, &StepIdentity::new("core", "iam", RegionDeployType::Regional, "us-east-1"), EntryResult::Fail).await;
        record(&sink, &StepIdentity::new("core", "iam", RegionDeployType::Regional, "us-east-2"), EntryResult::Success).await;

        let statuses = sink.flush_track("core").await;
        assert_eq!(statuses.len(), 1);
        let status = &statuses["exec-1#runiac#core#iam"];
        assert_eq!(status.failed_regions, vec!["regional/us-east-1"]);
        assert_eq!(status.result, RegionalResult::Unstable);
        assert_eq!(status.deployment_phase, "REGIONALPOSTDEPLOY");
        assert!(status.result_message.contains("failed in: regional/us-east-1"));
    }

    #[tokio::test]
    async fn test_all_failed_is_fail_and_tests_make_unstable() {
        let sink = StatusSink::new("exec-1", "runiac", "AWS");
        record(&sink, &StepIdentity::new("core", "a", RegionDeployType::Regional, "us-east-1"), EntryResult::Fail).await;
        record(&sink, &StepIdentity::new("core", "a", RegionDeployType::Regional, "us-east-2"), EntryResult::Fail).await;
        record(&sink, &StepIdentity::new("core", "b", RegionDeployType::Primary, "us-east-1"), EntryResult::Unstable).await;
        record(&sink, &StepIdentity::new("core", "c", RegionDeployType::Primary, "us-east-1"), EntryResult::Success).await;

        let statuses = sink.flush_track("core").await;
        assert_eq!(statuses["exec-1#runiac#core#a"].result, RegionalResult::Fail);
        assert_eq!(statuses["exec-1#runiac#core#b"].result, RegionalResult::Unstable);
        assert_eq!(statuses["exec-1#runiac#core#c"].result, RegionalResult::Success);
    }

    #[tokio::test]
    async fn test_flush_drains_only_its_track() {
        let sink = StatusSink::new("exec-1", "runiac", "AWS");
        record(&sink, &StepIdentity::new("net", "vpc", RegionDeployType::Primary, "us-east-1"), EntryResult::Success).await;
        record(&sink, &StepIdentity::new("network", "vpc", RegionDeployType::Primary, "us-east-1"), EntryResult::Success).await;

        assert_eq!(sink.flush_track("net").await.len(), 1);
        assert!(sink.flush_track("net").await.is_empty());
        assert_eq!(sink.pending(), 1);
        assert_eq!(sink.flush_track("network").await.len(), 1);
    }

    #[tokio::test]
    async fn test_reporter_calls_and_errors_are_swallowed() {
        let mut reporter = MockStatusReporter::new();
        reporter.expect_step_started().times(1).returning(|event| {
            assert_eq!(event.region, "us-east-1");
            Ok(())
        });
        reporter
            .expect_update_regional_status()
            .times(1)
            .returning(|_| Err(crate::error::CoreError::Reporting("unavailable".to_string())));

        let sink = StatusSink::new("exec-1", "runiac", "AWS").with_reporter(Arc::new(reporter));
        let primary = StepIdentity::new("core", "iam", RegionDeployType::Primary, "us-east-1");
        let regional = StepIdentity::new("core", "iam", RegionDeployType::Regional, "us-east-1");
        sink.record_step_start(&primary, false, &targets()).await;
        sink.record_step_start(&regional, false, &targets()).await;
        sink.record_step_success(&primary);
        sink.record_step_success(&regional);

        let statuses = sink.flush_track("core").await;
        assert_eq!(statuses.len(), 1);
    }

    #[tokio::test]
    async fn test_dry_run_does_not_report_start() {
        let mut reporter = MockStatusReporter::new();
        reporter.expect_step_started().times(0);
        let sink = StatusSink::new("exec-1", "runiac", "AWS").with_reporter(Arc::new(reporter));
        let primary = StepIdentity::new("core", "iam", RegionDeployType::Primary, "us-east-1");
        sink.record_step_start(&primary, true, &targets()).await;
        assert_eq!(sink.pending(), 1);
    }
}
