//! Terraform input variables.
//!
//! Terraform warns (and in newer versions errors) on values for undeclared
//! variables, so only declared variables are passed as `TF_VAR_*`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::error::IacResult;

fn variable_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?m)^\s*variable\s+"([^"]+)"\s*\{"#).expect("valid regex"))
}

/// Names of the variables declared by the `*.tf` files directly in `dir`.
pub fn declared_variables(dir: &Path) -> IacResult<BTreeSet<String>> {
    let mut names = BTreeSet::new();
    if !dir.is_dir() {
        return Ok(names);
    }

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() || path.extension().map_or(true, |ext| ext != "tf") {
            continue;
        }
        let source = fs::read_to_string(&path)?;
        names.extend(variable_re().captures_iter(&source).map(|c| c[1].to_string()));
    }

    Ok(names)
}

/// `TF_VAR_*` environment for the declared subset of `params`.
pub fn tf_var_env(params: &BTreeMap<String, String>, declared: &BTreeSet<String>) -> HashMap<String, String> {
    params
        .iter()
        .filter(|(name, _)| {
            let keep = declared.contains(*name);
            if !keep {
                debug!(variable = name.as_str(), "Not declared by step, not passed");
            }
            keep
        })
        .map(|(name, value)| (format!("TF_VAR_{}", name), value.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declared_variables() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("variables.tf"),
            r#"
variable "region" {}
variable "runiac_step" {
  type = string
}
# variable "commented" {}
"#,
        )
        .unwrap();
        fs::write(dir.path().join("main.tf"), "variable \"network-vpc_id\" {\n}\n").unwrap();
        fs::write(dir.path().join("notes.txt"), "variable \"ignored\" {}").unwrap();

        let names = declared_variables(dir.path()).unwrap();
        let expected: BTreeSet<String> = ["region", "runiac_step", "network-vpc_id"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(names, expected);
    }

    #[test]
    fn test_tf_var_env_filters_undeclared() {
        let mut params = BTreeMap::new();
        params.insert("region".to_string(), "us-east-1".to_string());
        params.insert("unused".to_string(), "x".to_string());
        let declared: BTreeSet<String> = ["region".to_string()].into_iter().collect();

        let env = tf_var_env(&params, &declared);
        assert_eq!(env.len(), 1);
        assert_eq!(env["TF_VAR_region"], "us-east-1");
    }
}
