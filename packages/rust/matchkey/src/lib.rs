//! Match key methods: derive match values from record payloads.
//!
//! This crate provides:
//! - [`MatchKeyMethod`] — the extraction capability (`payload -> set<string>`)
//! - [`JsonPathMethod`] — the built-in `jsonpath` method
//! - [`MethodCache`] — configured instances keyed by tenant and config id

pub mod cache;
pub mod jsonpath;

use std::collections::BTreeSet;
use std::sync::Arc;

use reservoir_shared::{MatchKeyConfig, ReservoirError, Result};
use serde_json::Value;

pub use cache::MethodCache;
pub use jsonpath::JsonPathMethod;

/// Names of the methods [`create_method`] knows about.
pub const METHODS: &[&str] = &[jsonpath::METHOD_NAME];

/// A configured match value extractor.
///
/// Implementations are pure: the same payload always yields the same set.
pub trait MatchKeyMethod: Send + Sync + std::fmt::Debug {
    /// Method name as stored in the match key config.
    fn name(&self) -> &'static str;

    /// Compute the match values of `payload`. An empty set is valid.
    fn match_values(&self, payload: &Value) -> Result<BTreeSet<String>>;
}

/// Instantiate the method called `method` with `params`.
pub fn create_method(method: &str, params: &Value) -> Result<Arc<dyn MatchKeyMethod>> {
    match method {
        jsonpath::METHOD_NAME => Ok(Arc::new(JsonPathMethod::from_params(params)?)),
        other => Err(ReservoirError::match_key(format!(
            "unknown match key method '{other}' (known: {})",
            METHODS.join(", ")
        ))),
    }
}

/// Check that a config names a known method with usable params.
pub fn validate_config(config: &MatchKeyConfig) -> Result<()> {
    if config.id.trim().is_empty() {
        return Err(ReservoirError::validation("match key id must not be empty"));
    }
    create_method(&config.method, &config.params).map(|_| ())
}
