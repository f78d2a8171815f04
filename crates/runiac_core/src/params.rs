//! Optional step parameters.
//!
//! Parameters are looked up at increasingly specific paths; deeper levels
//! override shallower ones.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult};

/// Source of optional parameters keyed by hierarchical path.
pub trait ParameterStore: Send + Sync {
    /// Parameters stored directly at `path`.
    fn parameters(&self, path: &str) -> CoreResult<BTreeMap<String, String>>;
}

/// Store with no parameters.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyParameterStore;

impl ParameterStore for EmptyParameterStore {
    fn parameters(&self, _path: &str) -> CoreResult<BTreeMap<String, String>> {
        Ok(BTreeMap::new())
    }
}

/// Parameters read from a YAML document of `path: { name: value }`.
#[derive(Debug, Clone, Default)]
pub struct YamlParameterStore {
    entries: BTreeMap<String, BTreeMap<String, String>>,
}

impl YamlParameterStore {
    pub fn from_file(path: &Path) -> CoreResult<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> CoreResult<Self> {
        let raw: BTreeMap<String, BTreeMap<String, serde_yaml::Value>> =
            serde_yaml::from_str(content)?;

        let mut entries = BTreeMap::new();
        for (path, values) in raw {
            let mut params = BTreeMap::new();
            for (name, value) in values {
                params.insert(name.clone(), scalar_to_string(&path, &name, value)?);
            }
            entries.insert(normalize_path(&path), params);
        }
        Ok(Self { entries })
    }
}

impl ParameterStore for YamlParameterStore {
    fn parameters(&self, path: &str) -> CoreResult<BTreeMap<String, String>> {
        Ok(self.entries.get(&normalize_path(path)).cloned().unwrap_or_default())
    }
}

fn normalize_path(path: &str) -> String {
    format!("/{}", path.trim_matches('/'))
}

fn scalar_to_string(path: &str, name: &str, value: serde_yaml::Value) -> CoreResult<String> {
    match value {
        serde_yaml::Value::String(s) => Ok(s),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::Null => Ok(String::new()),
        other => Err(CoreError::Parameters(format!(
            "{}: parameter '{}' must be a scalar, got {:?}",
            path, name, other
        ))),
    }
}

/// Lookup paths for a step, shallow to deep.
pub fn parameter_paths(project: &str, csp: &str, ring: &str, track: &str, step: &str) -> Vec<String> {
    let mut paths = Vec::with_capacity(5);
    let mut current = String::new();
    for segment in [project, csp, ring, track, step] {
        current.push('/');
        current.push_str(segment);
        paths.push(current.clone());
    }
    paths
}

/// Merge every level for a step. A failing level is logged and skipped.
pub fn load_step_parameters(
    store: &dyn ParameterStore,
    project: &str,
    csp: &str,
    ring: &str,
    track: &str,
    step: &str,
) -> BTreeMap<String, String> {
    let mut merged = BTreeMap::new();
    for path in parameter_paths(project, csp, ring, track, step) {
        match store.parameters(&path) {
            Ok(params) => {
                if !params.is_empty() {
                    debug!(path = path.as_str(), count = params.len(), "Loaded parameters");
                }
                merged.extend(params);
            }
            Err(e) => warn!(path = path.as_str(), "Failed to load parameters: {}", e),
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parameter_paths() {
        let paths = parameter_paths("runiac", "AWS", "prod", "core", "iam");
        assert_eq!(
            paths,
            vec![
                "/runiac",
                "/runiac/AWS",
                "/runiac/AWS/prod",
                "/runiac/AWS/prod/core",
                "/runiac/AWS/prod/core/iam",
            ]
        );
    }

    #[test]
    fn test_deepest_level_wins() {
        let store = YamlParameterStore::from_yaml(
            r#"
/runiac:
  owner: platform
  size: small
runiac/AWS/prod:
  size: large
  replicas: 3
/runiac/AWS/prod/core/iam:
  enabled: true
"#,
        )
        .unwrap();

        let params = load_step_parameters(&store, "runiac", "AWS", "prod", "core", "iam");
        assert_eq!(params["owner"], "platform");
        assert_eq!(params["size"], "large");
        assert_eq!(params["replicas"], "3");
        assert_eq!(params["enabled"], "true");

        let other = load_step_parameters(&store, "runiac", "AWS", "dev", "core", "iam");
        assert_eq!(other["size"], "small");
        assert!(!other.contains_key("enabled"));
    }

    #[test]
    fn test_non_scalar_rejected() {
        let result = YamlParameterStore::from_yaml("/runiac:\n  list: [1, 2]\n");
        assert!(matches!(result, Err(CoreError::Parameters(_))));
    }

    #[test]
    fn test_empty_store() {
        assert!(load_step_parameters(&EmptyParameterStore, "p", "AWS", "r", "t", "s").is_empty());
    }
}
