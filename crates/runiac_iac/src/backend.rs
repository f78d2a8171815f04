//! State-backend resolution.
//!
//! A step declares where Terraform keeps its state in a `backend` block. The
//! block's string attributes may reference engine placeholders, which are
//! substituted per execution before being handed to `terraform init`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use tracing::debug;

use runiac_runner::StepExecution;

use crate::error::{IacError, IacResult};

/// Attributes read from a backend block; everything else is ignored.
pub const BACKEND_ATTRIBUTES: &[&str] = &[
    "key",
    "bucket",
    "prefix",
    "role_arn",
    "resource_group_name",
    "storage_account_name",
    "path",
];

/// Supported state backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    S3,
    AzureStorageAccount,
    Gcs,
    Local,
    Unknown,
}

impl BackendKind {
    /// Map a Terraform backend type name.
    pub fn from_tf_name(name: &str) -> Self {
        match name {
            "s3" => BackendKind::S3,
            "azurerm" => BackendKind::AzureStorageAccount,
            "gcs" => BackendKind::Gcs,
            "local" => BackendKind::Local,
            _ => BackendKind::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::S3 => "S3",
            BackendKind::AzureStorageAccount => "AzureStorageAccount",
            BackendKind::Gcs => "GCS",
            BackendKind::Local => "Local",
            BackendKind::Unknown => "Unknown",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A resolved state backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerraformBackend {
    pub kind: BackendKind,
    /// Populated attributes only, after placeholder substitution
    pub config: BTreeMap<String, String>,
}

impl TerraformBackend {
    pub fn local() -> Self {
        Self {
            kind: BackendKind::Local,
            config: BTreeMap::new(),
        }
    }

    /// `-backend-config` arguments for `terraform init`.
    pub fn to_init_args(&self) -> Vec<String> {
        self.config
            .iter()
            .map(|(k, v)| format!("-backend-config={}={}", k, v))
            .collect()
    }
}

/// Read `-backend-config=k=v` arguments back into a map.
pub fn parse_init_args<S: AsRef<str>>(args: &[S]) -> BTreeMap<String, String> {
    args.iter()
        .filter_map(|arg| arg.as_ref().strip_prefix("-backend-config="))
        .filter_map(|kv| kv.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Raw backend block as written in the source files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendBlock {
    pub tf_type: String,
    pub attributes: BTreeMap<String, String>,
}

fn backend_start_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"backend\s+"([A-Za-z0-9_\-]+)"\s*\{"#).expect("valid regex"))
}

fn attribute_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"^\s*([A-Za-z_][A-Za-z0-9_]*)\s*=\s*"((?:[^"\\]|\\.)*)"\s*$"#).expect("valid regex")
    })
}

fn core_account_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\$\{var\.core_account_ids_map\.([A-Za-z0-9_\-]+)\}").expect("valid regex")
    })
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{[^}]+\}").expect("valid regex"))
}

fn strip_comment(line: &str) -> &str {
    let mut in_string = false;
    let bytes = line.as_bytes();
    for (i, c) in line.char_indices() {
        match c {
            '"' if i == 0 || bytes[i - 1] != b'\\' => in_string = !in_string,
            '#' if !in_string => return &line[..i],
            '/' if !in_string && line[i..].starts_with("//") => return &line[..i],
            _ => {}
        }
    }
    line
}

/// Find the first backend block in a Terraform source.
pub fn parse_backend_block(source: &str) -> Option<BackendBlock> {
    let start = backend_start_re().captures(source)?;
    let tf_type = start[1].to_string();
    let body_start = start.get(0)?.end();

    let mut depth = 1usize;
    let mut attributes = BTreeMap::new();
    for line in source[body_start..].lines() {
        let line = strip_comment(line);
        let opens = line.matches('{').count();
        let closes = line.matches('}').count();

        if depth == 1 {
            if let Some(caps) = attribute_re().captures(line) {
                attributes.insert(caps[1].to_string(), caps[2].to_string());
            }
        }

        depth += opens;
        if closes >= depth {
            break;
        }
        depth -= closes;
    }

    Some(BackendBlock { tf_type, attributes })
}

/// Terraform files in `dir`, `backend.tf` first, the rest by name.
fn tf_files(dir: &Path) -> IacResult<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| p.is_file() && p.extension().map_or(false, |ext| ext == "tf"))
        .collect();

    files.sort_by_key(|p| {
        let is_backend = p.file_name().map_or(false, |n| n == "backend.tf");
        (!is_backend, p.clone())
    });
    Ok(files)
}

/// Locate and read the backend block of a step's working directory.
pub fn read_backend_block(dir: &Path) -> IacResult<Option<BackendBlock>> {
    for file in tf_files(dir)? {
        let source = fs::read_to_string(&file)?;
        if let Some(block) = parse_backend_block(&source) {
            debug!("Found {} backend in {:?}", block.tf_type, file);
            return Ok(Some(block));
        }
    }
    Ok(None)
}

/// Resolve the state backend for an execution.
///
/// A directory without a backend block uses Terraform's local default.
pub fn resolve_backend(exec: &StepExecution) -> IacResult<TerraformBackend> {
    match read_backend_block(&exec.dir)? {
        Some(block) => backend_from_block(&block, exec),
        None => Ok(TerraformBackend::local()),
    }
}

/// Turn a parsed block into a resolved backend for `exec`.
pub fn backend_from_block(block: &BackendBlock, exec: &StepExecution) -> IacResult<TerraformBackend> {
    let kind = BackendKind::from_tf_name(&block.tf_type);
    if kind == BackendKind::Unknown {
        return Err(IacError::UnknownBackend(block.tf_type.clone()));
    }

    let config = BACKEND_ATTRIBUTES
        .iter()
        .filter_map(|attr| {
            block
                .attributes
                .get(*attr)
                .map(|value| (attr.to_string(), interpolate(value, exec)))
        })
        .collect();

    Ok(TerraformBackend { kind, config })
}

/// Substitute engine placeholders in a backend attribute.
///
/// Unrecognised placeholders are left untouched.
pub fn interpolate(value: &str, exec: &StepExecution) -> String {
    let namespace = if exec.namespace.is_empty() {
        String::new()
    } else {
        format!("{}-", exec.namespace)
    };

    let mut out = value
        .replace("${var.runiac_deployment_ring}", &exec.deployment_ring)
        .replace("${var.runiac_target_account_id}", &exec.account_id)
        .replace("${var.runiac_step}", &exec.step_name)
        .replace("${var.runiac_region_deploy_type}", exec.region_deploy_type.as_str())
        .replace("${var.region}", &exec.region)
        .replace("${var.environment}", &exec.environment)
        .replace("${local.namespace-}", &namespace);

    out = core_account_re()
        .replace_all(&out, |caps: &Captures<'_>| {
            exec.core_accounts
                .get(&caps[1])
                .cloned()
                .unwrap_or_else(|| caps[0].to_string())
        })
        .into_owned();

    for leftover in placeholder_re().find_iter(&out) {
        debug!(placeholder = leftover.as_str(), "Unrecognised backend placeholder left as-is");
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use runiac_runner::RegionDeployType;
    use std::time::Duration;

    fn execution() -> StepExecution {
        let mut core_accounts = BTreeMap::new();
        core_accounts.insert("logging".to_string(), "111111111111".to_string());
        StepExecution {
            execution_id: "exec".to_string(),
            project: "runiac".to_string(),
            track_name: "core".to_string(),
            step_name: "iam".to_string(),
            step_id: "#runiac#core#iam".to_string(),
            region: "eu-west-1".to_string(),
            region_deploy_type: RegionDeployType::Regional,
            dir: PathBuf::from("."),
            csp: "AWS".to_string(),
            environment: "nonprod".to_string(),
            account_id: "123456789012".to_string(),
            core_accounts,
            namespace: "feature1".to_string(),
            deployment_ring: "internal".to_string(),
            region_group: "eu".to_string(),
            primary_region: "eu-west-1".to_string(),
            dry_run: false,
            self_destroy: false,
            max_retries: 0,
            max_test_retries: 0,
            retry_backoff: Duration::ZERO,
            junit_dir: PathBuf::from("/output/junit"),
            required_params: BTreeMap::new(),
            optional_params: BTreeMap::new(),
            default_step_output_variables: BTreeMap::new(),
        }
    }

    #[test]
    fn test_interpolate_step_and_region() {
        let exec = execution();
        assert_eq!(
            interpolate("/${var.runiac_step}-${var.region}.tfstate", &exec),
            "/iam-eu-west-1.tfstate"
        );
    }

    #[test]
    fn test_interpolate_all_placeholders() {
        let exec = execution();
        let value = "${local.namespace-}${var.runiac_deployment_ring}/${var.runiac_target_account_id}/\
                     ${var.runiac_region_deploy_type}/${var.environment}/${var.core_account_ids_map.logging}";
        assert_eq!(
            interpolate(value, &exec),
            "feature1-internal/123456789012/regional/nonprod/111111111111"
        );
    }

    #[test]
    fn test_interpolate_empty_namespace() {
        let mut exec = execution();
        exec.namespace.clear();
        assert_eq!(interpolate("${local.namespace-}state", &exec), "state");
    }

    #[test]
    fn test_interpolate_leaves_unknown_tokens() {
        let exec = execution();
        let value = "${var.unknown}/${var.core_account_ids_map.missing}/${var.region}";
        assert_eq!(
            interpolate(value, &exec),
            "${var.unknown}/${var.core_account_ids_map.missing}/eu-west-1"
        );
    }

    #[test]
    fn test_interpolate_is_idempotent() {
        let exec = execution();
        let value = "${var.runiac_step}/${var.other}/${var.core_account_ids_map.logging}/${local.namespace-}x";
        let once = interpolate(value, &exec);
        assert_eq!(interpolate(&once, &exec), once);
    }

    #[test]
    fn test_parse_backend_block() {
        let source = r#"
terraform {
  # state lives in s3
  backend "s3" {
    key      = "/${var.runiac_step}-${var.region}.tfstate"
    bucket   = "state-bucket" // shared
    role_arn = "arn:aws:iam::${var.runiac_target_account_id}:role/state"
    encrypt  = true
  }

  required_version = ">= 1.0"
}
"#;
        let block = parse_backend_block(source).unwrap();
        assert_eq!(block.tf_type, "s3");
        assert_eq!(block.attributes.len(), 3);
        assert_eq!(block.attributes["bucket"], "state-bucket");
    }

    #[test]
    fn test_backend_only_keeps_known_populated_attributes() {
        let mut attributes = BTreeMap::new();
        attributes.insert("key".to_string(), "/${var.runiac_step}-${var.region}.tfstate".to_string());
        attributes.insert("dynamodb_table".to_string(), "locks".to_string());
        let block = BackendBlock {
            tf_type: "s3".to_string(),
            attributes,
        };

        let backend = backend_from_block(&block, &execution()).unwrap();
        assert_eq!(backend.kind, BackendKind::S3);
        assert_eq!(backend.config.len(), 1);
        assert_eq!(backend.config["key"], "/iam-eu-west-1.tfstate");
    }

    #[test]
    fn test_unknown_backend_is_an_error() {
        let block = BackendBlock {
            tf_type: "consul".to_string(),
            attributes: BTreeMap::new(),
        };
        assert!(matches!(
            backend_from_block(&block, &execution()),
            Err(IacError::UnknownBackend(kind)) if kind == "consul"
        ));
    }

    #[test]
    fn test_init_args_round_trip() {
        let mut config = BTreeMap::new();
        config.insert("resource_group_name".to_string(), "rg-state".to_string());
        config.insert("storage_account_name".to_string(), "tfstate".to_string());
        config.insert("key".to_string(), "a=b.tfstate".to_string());
        let backend = TerraformBackend {
            kind: BackendKind::AzureStorageAccount,
            config: config.clone(),
        };

        assert_eq!(parse_init_args(&backend.to_init_args()), config);
    }
}
