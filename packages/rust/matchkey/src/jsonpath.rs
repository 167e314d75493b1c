//! The `jsonpath` match key method.
//!
//! Params: `{ "expr": "<JSONPath>" }`. A single matched node that is a string
//! is one match value; a single matched array contributes its elements. When
//! the path matches several nodes they form one list. A list (or array)
//! holding anything but strings contributes nothing at all.

use std::collections::BTreeSet;

use reservoir_shared::{ReservoirError, Result};
use serde_json::Value;
use serde_json_path::JsonPath;

use crate::MatchKeyMethod;

pub(crate) const METHOD_NAME: &str = "jsonpath";

/// Compiled JSONPath extractor.
#[derive(Debug)]
pub struct JsonPathMethod {
    path: JsonPath,
}

impl JsonPathMethod {
    /// Compile `expr`.
    pub fn new(expr: &str) -> Result<Self> {
        let path = JsonPath::parse(expr)
            .map_err(|e| ReservoirError::match_key(format!("jsonpath: invalid expr '{expr}': {e}")))?;
        Ok(Self { path })
    }

    /// Build from match key config params.
    pub fn from_params(params: &Value) -> Result<Self> {
        let expr = params
            .get("expr")
            .and_then(Value::as_str)
            .ok_or_else(|| ReservoirError::match_key("jsonpath: expr must be given"))?;
        Self::new(expr)
    }

    /// First string matched in `payload`, if any.
    ///
    /// Used to derive a record's local identifier when the batch omits it.
    pub fn first_string(&self, payload: &Value) -> Option<String> {
        self.path.query(payload).all().into_iter().find_map(|node| match node {
            Value::String(s) => Some(s.clone()),
            Value::Array(items) => items.iter().find_map(|v| v.as_str().map(String::from)),
            _ => None,
        })
    }
}

impl MatchKeyMethod for JsonPathMethod {
    fn name(&self) -> &'static str {
        METHOD_NAME
    }

    fn match_values(&self, payload: &Value) -> Result<BTreeSet<String>> {
        let mut nodes = self.path.query(payload).all();
        if let (1, Some(Value::Array(array))) = (nodes.len(), nodes.first().copied()) {
            nodes = array.iter().collect();
        }
        Ok(all_strings(&nodes).unwrap_or_default())
    }
}

fn all_strings(items: &[&Value]) -> Option<BTreeSet<String>> {
    items
        .iter()
        .map(|v| v.as_str().map(String::from))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn values(expr: &str, payload: Value) -> Vec<String> {
        JsonPathMethod::new(expr)
            .unwrap()
            .match_values(&payload)
            .unwrap()
            .into_iter()
            .collect()
    }

    #[test]
    fn wildcard_collects_strings() {
        let payload = json!({
            "identifiers": [{"isbn": "222"}, {"isbn": "111"}, {"issn": "0000"}]
        });
        assert_eq!(values("$.identifiers[*].isbn", payload), vec!["111", "222"]);
    }

    #[test]
    fn single_string() {
        assert_eq!(values("$.title", json!({"title": "Dune"})), vec!["Dune"]);
    }

    #[test]
    fn array_of_strings_is_flattened() {
        assert_eq!(values("$.isbns", json!({"isbns": ["1", "2"]})), vec!["1", "2"]);
    }

    #[test]
    fn mixed_array_is_ignored() {
        assert!(values("$.isbns", json!({"isbns": ["1", 2]})).is_empty());
    }

    #[test]
    fn one_non_string_match_discards_all() {
        let payload = json!({"identifiers": [{"isbn": "111"}, {"isbn": 5}]});
        assert!(values("$.identifiers[*].isbn", payload).is_empty());
    }

    #[test]
    fn nested_arrays_from_wildcard_are_ignored() {
        let payload = json!({"groups": [{"isbns": ["1", "2"]}, {"isbns": ["3"]}]});
        assert!(values("$.groups[*].isbns", payload).is_empty());
    }

    #[test]
    fn missing_path_yields_nothing() {
        assert!(values("$.nothing.here", json!({"title": "x"})).is_empty());
    }

    #[test]
    fn non_string_scalars_ignored() {
        assert!(values("$.year", json!({"year": 1965})).is_empty());
    }

    #[test]
    fn invalid_expression_rejected() {
        let err = JsonPathMethod::new("$[").unwrap_err();
        assert!(err.to_string().contains("invalid expr"));
    }

    #[test]
    fn missing_expr_param() {
        let err = JsonPathMethod::from_params(&json!({"path": "$.x"})).unwrap_err();
        assert!(err.to_string().contains("expr must be given"));
    }

    #[test]
    fn first_string_for_local_id() {
        let m = JsonPathMethod::new("$.marc.fields[*]['001']").unwrap();
        let payload = json!({"marc": {"fields": [{"245": "t"}, {"001": "  a1 "}]}});
        assert_eq!(m.first_string(&payload).as_deref(), Some("  a1 "));
        assert_eq!(m.first_string(&json!({})), None);
    }
}
