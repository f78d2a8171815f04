//! Run configuration.
//!
//! Loaded once from `RUNIAC_*` environment variables and immutable afterwards.
//! Loading goes through a lookup closure so tests can supply a plain map.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use runiac_runner::RunnerKind;

use crate::error::{CoreError, CoreResult};

const ENV_PREFIX: &str = "RUNIAC_";

/// Cloud service provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Csp {
    Aws,
    Azu,
    Gcp,
}

impl Csp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Csp::Aws => "AWS",
            Csp::Azu => "AZU",
            Csp::Gcp => "GCP",
        }
    }
}

impl fmt::Display for Csp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Csp {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "AWS" => Ok(Csp::Aws),
            "AZU" | "AZURE" => Ok(Csp::Azu),
            "GCP" => Ok(Csp::Gcp),
            other => Err(CoreError::Config(format!("unknown csp '{}'", other))),
        }
    }
}

/// csp → region group → regions. The first region of a group is its primary.
pub type RegionGroups = BTreeMap<String, BTreeMap<String, Vec<String>>>;

/// Built-in region groups.
pub fn default_region_groups() -> RegionGroups {
    fn group(entries: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        entries
            .iter()
            .map(|(name, regions)| {
                (
                    name.to_string(),
                    regions.iter().map(|r| r.to_string()).collect(),
                )
            })
            .collect()
    }

    let mut groups = RegionGroups::new();
    groups.insert(
        "AWS".to_string(),
        group(&[
            ("us", &["us-east-1", "us-east-2", "us-west-1", "us-west-2"]),
            ("eu", &["eu-west-1", "eu-central-1", "eu-west-3", "eu-north-1"]),
            ("uk", &["eu-west-2"]),
        ]),
    );
    groups.insert(
        "AZU".to_string(),
        group(&[
            ("us", &["eastus", "eastus2", "centralus", "westus2"]),
            ("eu", &["westeurope", "northeurope", "francecentral"]),
            ("uk", &["uksouth", "ukwest"]),
        ]),
    );
    groups.insert(
        "GCP".to_string(),
        group(&[
            ("us", &["us-east1", "us-east4", "us-central1", "us-west1"]),
            ("eu", &["europe-west1", "europe-west3", "europe-north1"]),
            ("uk", &["europe-west2"]),
        ]),
    );
    groups
}

fn region_group_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(us|eu|uk)$").expect("valid regex"))
}

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub account_id: String,
    pub environment: String,
    pub namespace: String,
    pub project: String,
    pub deployment_ring: String,
    pub dry_run: bool,
    pub self_destroy: bool,
    pub primary_region_override: Option<String>,
    pub region_group: String,
    /// Resolved primary region: the override, else the first region of the group
    pub primary_region: String,
    pub target_regions: Vec<String>,
    pub region_groups: RegionGroups,
    pub step_whitelist: Vec<String>,
    pub target_all: bool,
    pub max_retries: u32,
    pub max_test_retries: u32,
    pub log_level: String,
    pub version: String,
    pub csp: Csp,
    pub core_accounts: BTreeMap<String, String>,
    pub execution_id: String,
    pub runner: RunnerKind,
    pub tracks_dir: PathBuf,
    pub junit_dir: PathBuf,
    pub retry_backoff: Duration,
    pub parameters_file: Option<PathBuf>,
    pub status_reporting: bool,
}

/// Typed reads over a raw lookup.
struct EnvReader<F> {
    lookup: F,
}

impl<F> EnvReader<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(&format!("{}{}", ENV_PREFIX, name))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, name: &str) -> CoreResult<String> {
        self.string(name).ok_or_else(|| {
            CoreError::Config(format!("{}{} is required", ENV_PREFIX, name))
        })
    }

    fn bool(&self, name: &str, default: bool) -> CoreResult<bool> {
        match self.string(name) {
            None => Ok(default),
            Some(value) => match value.to_lowercase().as_str() {
                "true" | "1" | "yes" | "y" => Ok(true),
                "false" | "0" | "no" | "n" => Ok(false),
                _ => Err(CoreError::Config(format!(
                    "{}{} must be a boolean, got '{}'",
                    ENV_PREFIX, name, value
                ))),
            },
        }
    }

    fn number<T: FromStr>(&self, name: &str, default: T) -> CoreResult<T> {
        match self.string(name) {
            None => Ok(default),
            Some(value) => value.parse().map_err(|_| {
                CoreError::Config(format!(
                    "{}{} must be a non-negative integer, got '{}'",
                    ENV_PREFIX, name, value
                ))
            }),
        }
    }

    fn list(&self, name: &str) -> Vec<String> {
        self.string(name)
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Config {
    /// Load from the process environment.
    pub fn from_env() -> CoreResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load from an arbitrary variable lookup and validate.
    pub fn from_lookup<F>(lookup: F) -> CoreResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = Self::read_lookup(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse every variable from `lookup` without the cross-field checks,
    /// for callers that apply overrides first.
    pub fn read_lookup<F>(lookup: F) -> CoreResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = EnvReader { lookup };

        let csp: Csp = env.required("CSP")?.parse()?;
        let region_groups = match env.string("REGION_GROUPS") {
            Some(json) => serde_json::from_str(&json).map_err(|e| {
                CoreError::Config(format!("{}REGION_GROUPS is not valid JSON: {}", ENV_PREFIX, e))
            })?,
            None => default_region_groups(),
        };
        let region_group = env.string("REGION_GROUP").unwrap_or_else(|| "us".to_string());
        let primary_region_override = env.string("PRIMARY_REGION");
        let primary_region = match &primary_region_override {
            Some(region) => region.clone(),
            None => primary_region_for(&region_groups, csp, &region_group)?,
        };

        let mut target_regions: Vec<String> = Vec::new();
        for region in env.list("TARGET_REGIONS") {
            if target_regions.contains(&region) {
                warn!(region = region.as_str(), "Duplicate target region ignored");
            } else {
                target_regions.push(region);
            }
        }
        if target_regions.is_empty() {
            target_regions.push(primary_region.clone());
        }

        let core_accounts = match env.string("CORE_ACCOUNTS") {
            Some(json) => serde_json::from_str(&json).map_err(|e| {
                CoreError::Config(format!("{}CORE_ACCOUNTS is not valid JSON: {}", ENV_PREFIX, e))
            })?,
            None => BTreeMap::new(),
        };

        let runner = env
            .string("RUNNER")
            .map(|r| r.parse::<RunnerKind>())
            .transpose()
            .map_err(|e| CoreError::Config(e.to_string()))?
            .unwrap_or_default();

        let config = Self {
            account_id: env
                .string("ACCOUNT_ID")
                .or_else(|| env.string("TARGET_ACCOUNT_ID"))
                .unwrap_or_default(),
            environment: env.required("ENVIRONMENT")?,
            namespace: env.string("NAMESPACE").unwrap_or_default(),
            project: env.string("PROJECT").unwrap_or_else(|| "runiac".to_string()),
            deployment_ring: env.string("DEPLOYMENT_RING").unwrap_or_default(),
            dry_run: env.bool("DRY_RUN", false)?,
            self_destroy: env.bool("SELF_DESTROY", false)?,
            primary_region_override,
            region_group,
            primary_region,
            target_regions,
            region_groups,
            step_whitelist: env.list("STEP_WHITELIST"),
            target_all: env.bool("TARGET_ALL", true)?,
            max_retries: env.number("MAX_RETRIES", 3)?,
            max_test_retries: env.number("MAX_TEST_RETRIES", 2)?,
            log_level: env.string("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            version: env
                .string("VERSION")
                .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string()),
            csp,
            core_accounts,
            execution_id: env
                .string("EXECUTION_ID")
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            runner,
            tracks_dir: env
                .string("TRACKS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./tracks")),
            junit_dir: env
                .string("JUNIT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("/output/junit")),
            retry_backoff: Duration::from_secs(env.number("RETRY_BACKOFF_SECONDS", 10)?),
            parameters_file: env.string("PARAMETERS_FILE").map(PathBuf::from),
            status_reporting: env.bool("STATUS_REPORTING", false)?,
        };

        debug!(
            execution_id = config.execution_id.as_str(),
            csp = %config.csp,
            primary_region = config.primary_region.as_str(),
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> CoreResult<()> {
        if self.environment.is_empty() {
            return Err(CoreError::Config("environment is required".to_string()));
        }
        if !region_group_re().is_match(&self.region_group) {
            return Err(CoreError::Config(format!(
                "region group '{}' must be one of us, eu, uk",
                self.region_group
            )));
        }
        if matches!(self.environment.as_str(), "local" | "pr")
            && !self.dry_run
            && self.namespace.is_empty()
        {
            return Err(CoreError::Config(format!(
                "namespace is required for environment '{}' unless dry run is set",
                self.environment
            )));
        }
        if self.target_regions.is_empty() {
            return Err(CoreError::Config("at least one target region is required".to_string()));
        }
        if !self.target_all && self.step_whitelist.is_empty() {
            return Err(CoreError::Config(
                "step whitelist is required when target all is false".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether a step id (`#project#track#step`) should run.
    pub fn is_step_targeted(&self, step_id: &str) -> bool {
        self.target_all || self.step_whitelist.iter().any(|s| s == step_id)
    }

    /// Every region of the configured group, for reference.
    pub fn region_group_regions(&self) -> Vec<String> {
        self.region_groups
            .get(self.csp.as_str())
            .and_then(|groups| groups.get(&self.region_group))
            .cloned()
            .unwrap_or_default()
    }
}

fn primary_region_for(groups: &RegionGroups, csp: Csp, group: &str) -> CoreResult<String> {
    groups
        .get(csp.as_str())
        .and_then(|g| g.get(group))
        .and_then(|regions| regions.first())
        .cloned()
        .ok_or_else(|| {
            CoreError::Config(format!("no regions for csp {} and region group '{}'", csp, group))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> CoreResult<Config> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (format!("RUNIAC_{}", k), v.to_string()))
            .collect();
        Config::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("CSP", "AWS"), ("ENVIRONMENT", "prod")]).unwrap();
        assert_eq!(config.project, "runiac");
        assert_eq!(config.region_group, "us");
        assert_eq!(config.primary_region, "us-east-1");
        assert_eq!(config.target_regions, vec!["us-east-1"]);
        assert!(config.target_all);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.max_test_retries, 2);
        assert_eq!(config.retry_backoff, Duration::from_secs(10));
        assert_eq!(config.runner, RunnerKind::Terraform);
        assert!(!config.execution_id.is_empty());
    }

    #[test]
    fn test_primary_region_override_wins() {
        let config = load(&[
            ("CSP", "AZU"),
            ("ENVIRONMENT", "prod"),
            ("REGION_GROUP", "eu"),
            ("PRIMARY_REGION", "northeurope"),
            ("TARGET_REGIONS", "westeurope, northeurope"),
        ])
        .unwrap();
        assert_eq!(config.primary_region, "northeurope");
        assert_eq!(config.target_regions, vec!["westeurope", "northeurope"]);
        assert_eq!(config.region_group_regions()[0], "westeurope");
    }

    #[test]
    fn test_duplicate_target_regions_collapsed() {
        let config = load(&[
            ("CSP", "AWS"),
            ("ENVIRONMENT", "prod"),
            ("TARGET_REGIONS", "us-east-1,us-east-2, us-east-1,us-east-2"),
        ])
        .unwrap();
        assert_eq!(config.target_regions, vec!["us-east-1", "us-east-2"]);
    }

    #[test]
    fn test_read_lookup_defers_validation() {
        let map: HashMap<String, String> = [("RUNIAC_CSP", "AWS"), ("RUNIAC_ENVIRONMENT", "local")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut config = Config::read_lookup(|name| map.get(name).cloned()).unwrap();
        assert!(config.validate().is_err());

        config.dry_run = true;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_account_id_alias() {
        let config = load(&[
            ("CSP", "AWS"),
            ("ENVIRONMENT", "prod"),
            ("TARGET_ACCOUNT_ID", "123456789012"),
        ])
        .unwrap();
        assert_eq!(config.account_id, "123456789012");
    }

    #[test]
    fn test_namespace_required_for_local() {
        let err = load(&[("CSP", "AWS"), ("ENVIRONMENT", "local")]).unwrap_err();
        assert!(err.to_string().contains("namespace"));

        let config = load(&[("CSP", "AWS"), ("ENVIRONMENT", "pr"), ("DRY_RUN", "true")]).unwrap();
        assert!(config.dry_run);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(load(&[("ENVIRONMENT", "prod")]).is_err());
        assert!(load(&[("CSP", "IBM"), ("ENVIRONMENT", "prod")]).is_err());
        assert!(load(&[("CSP", "AWS"), ("ENVIRONMENT", "prod"), ("REGION_GROUP", "ap")]).is_err());
        assert!(load(&[("CSP", "AWS"), ("ENVIRONMENT", "prod"), ("MAX_RETRIES", "-1")]).is_err());
        assert!(load(&[("CSP", "AWS"), ("ENVIRONMENT", "prod"), ("DRY_RUN", "maybe")]).is_err());
        assert!(load(&[("CSP", "AWS"), ("ENVIRONMENT", "prod"), ("RUNNER", "arm")]).is_err());
    }

    #[test]
    fn test_region_groups_and_accounts_from_json() {
        let config = load(&[
            ("CSP", "GCP"),
            ("ENVIRONMENT", "nonprod"),
            ("REGION_GROUPS", r#"{"GCP":{"us":["us-west4","us-east1"]}}"#),
            ("CORE_ACCOUNTS", r#"{"logging":"111","network":"222"}"#),
        ])
        .unwrap();
        assert_eq!(config.primary_region, "us-west4");
        assert_eq!(config.core_accounts["network"], "222");
    }

    #[test]
    fn test_step_whitelist() {
        let config = load(&[
            ("CSP", "AWS"),
            ("ENVIRONMENT", "prod"),
            ("TARGET_ALL", "false"),
            ("STEP_WHITELIST", "#runiac#core#iam,#runiac#net#vpc"),
        ])
        .unwrap();
        assert!(config.is_step_targeted("#runiac#core#iam"));
        assert!(!config.is_step_targeted("#runiac#core#dns"));
    }
}
