//! Keyed cache of configured match key method instances.
//!
//! Compiling a method (e.g. parsing a JSONPath expression) is done once per
//! (tenant, config id) and reused across records until the config's method
//! or params change, or the entry is purged.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use reservoir_shared::{MatchKeyConfig, Result, TenantId};
use serde_json::Value;
use tracing::debug;

use crate::{MatchKeyMethod, create_method};

#[derive(Debug)]
struct CacheEntry {
    method: String,
    params: Value,
    instance: Arc<dyn MatchKeyMethod>,
}

/// Method instances keyed by `(tenant, match key config id)`.
#[derive(Debug, Default)]
pub struct MethodCache {
    entries: RwLock<HashMap<(String, String), CacheEntry>>,
}

impl MethodCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the instance for `config`, creating or rebuilding it as needed.
    pub fn get(
        &self,
        tenant: &TenantId,
        config: &MatchKeyConfig,
    ) -> Result<Arc<dyn MatchKeyMethod>> {
        let key = (tenant.to_string(), config.id.clone());
        {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = entries.get(&key) {
                if entry.method == config.method && entry.params == config.params {
                    return Ok(entry.instance.clone());
                }
            }
        }

        let instance = create_method(&config.method, &config.params)?;
        debug!(%tenant, match_key = %config.id, method = %config.method, "configured match key method");
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries.insert(
            key,
            CacheEntry {
                method: config.method.clone(),
                params: config.params.clone(),
                instance: instance.clone(),
            },
        );
        Ok(instance)
    }

    /// Drop the entry for one config. Returns whether an entry existed.
    pub fn purge(&self, tenant: &TenantId, id: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        entries
            .remove(&(tenant.to_string(), id.to_string()))
            .is_some()
    }

    /// Drop every entry.
    pub fn purge_all(&self) {
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
