//! Step output variables.
//!
//! Runners return arbitrary IaC outputs. They are carried as [`OutputValue`]
//! and stringified when handed to later steps.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single output value produced by a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutputValue {
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    List(Vec<OutputValue>),
    Map(BTreeMap<String, OutputValue>),
}

impl OutputValue {
    /// Textual form used when passing the value to a downstream step.
    ///
    /// Primitives use their plain form; lists and maps are compact JSON.
    pub fn to_param_string(&self) -> String {
        match self {
            OutputValue::String(s) => s.clone(),
            OutputValue::Bool(b) => b.to_string(),
            OutputValue::Number(n) => n.to_string(),
            OutputValue::List(_) | OutputValue::Map(_) => {
                serde_json::to_string(self).unwrap_or_default()
            }
        }
    }
}

impl From<serde_json::Value> for OutputValue {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => OutputValue::String(String::new()),
            serde_json::Value::Bool(b) => OutputValue::Bool(b),
            serde_json::Value::Number(n) => OutputValue::Number(n),
            serde_json::Value::String(s) => OutputValue::String(s),
            serde_json::Value::Array(items) => {
                OutputValue::List(items.into_iter().map(OutputValue::from).collect())
            }
            serde_json::Value::Object(map) => OutputValue::Map(
                map.into_iter().map(|(k, v)| (k, OutputValue::from(v))).collect(),
            ),
        }
    }
}

impl From<&str> for OutputValue {
    fn from(value: &str) -> Self {
        OutputValue::String(value.to_string())
    }
}

impl From<String> for OutputValue {
    fn from(value: String) -> Self {
        OutputValue::String(value)
    }
}

impl From<bool> for OutputValue {
    fn from(value: bool) -> Self {
        OutputValue::Bool(value)
    }
}

impl From<i64> for OutputValue {
    fn from(value: i64) -> Self {
        OutputValue::Number(value.into())
    }
}

/// Output variables accumulated within one region: step key → variable → value.
pub type StepOutputVariables = BTreeMap<String, BTreeMap<String, String>>;

/// Stringify a runner's output map for storage in [`StepOutputVariables`].
pub fn stringify_outputs(outputs: &BTreeMap<String, OutputValue>) -> BTreeMap<String, String> {
    outputs
        .iter()
        .map(|(name, value)| (name.clone(), value.to_param_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_primitives_stringify_plainly() {
        assert_eq!(OutputValue::from("vpc-123").to_param_string(), "vpc-123");
        assert_eq!(OutputValue::from(true).to_param_string(), "true");
        assert_eq!(OutputValue::from(42).to_param_string(), "42");
        assert_eq!(OutputValue::from(json!(1.5)).to_param_string(), "1.5");
    }

    #[test]
    fn test_collections_stringify_as_json() {
        let list = OutputValue::from(json!(["a", "b"]));
        assert_eq!(list.to_param_string(), r#"["a","b"]"#);

        let map = OutputValue::from(json!({"b": 2, "a": [true]}));
        assert_eq!(map.to_param_string(), r#"{"a":[true],"b":2}"#);
    }

    #[test]
    fn test_null_becomes_empty_string() {
        assert_eq!(OutputValue::from(json!(null)), OutputValue::String(String::new()));
    }

    #[test]
    fn test_stringify_outputs() {
        let mut outputs = BTreeMap::new();
        outputs.insert("id".to_string(), OutputValue::from("abc"));
        outputs.insert("ports".to_string(), OutputValue::from(json!([80, 443])));

        let flat = stringify_outputs(&outputs);
        assert_eq!(flat["id"], "abc");
        assert_eq!(flat["ports"], "[80,443]");
    }
}
