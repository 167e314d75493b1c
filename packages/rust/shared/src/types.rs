//! Core domain types for the record reservoir.

use std::collections::HashMap;
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ReservoirError, Result};

/// Update strategy value that disables automatic match key computation.
pub const UPDATE_MANUAL: &str = "manual";

/// Update strategy value used when none is given.
pub const UPDATE_INGEST: &str = "ingest";

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a new time-sortable identifier.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

uuid_id!(
    /// Identifier of a stored global record (UUID v7).
    RecordId
);

uuid_id!(
    /// Identifier of a cluster (UUID v7, so ordering follows creation time).
    ClusterId
);

static SOURCE_ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[a-zA-Z0-9:/-]{1,16}$").expect("valid source id pattern"));

static TENANT_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new("^[a-z][a-z0-9_]{0,62}$").expect("valid tenant pattern"));

/// Identifier of a record source (a contributing library), upper-cased.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SourceId(String);

impl SourceId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for SourceId {
    type Err = ReservoirError;

    fn from_str(s: &str) -> Result<Self> {
        if !SOURCE_ID_PATTERN.is_match(s) {
            return Err(ReservoirError::validation(format!(
                "sourceId '{s}' does not match {}",
                SOURCE_ID_PATTERN.as_str()
            )));
        }
        Ok(Self(s.to_uppercase()))
    }
}

impl TryFrom<String> for SourceId {
    type Error = ReservoirError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<SourceId> for String {
    fn from(id: SourceId) -> Self {
        id.0
    }
}

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tenant name. Each tenant has its own database; nothing crosses tenants.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantId(String);

impl TenantId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::str::FromStr for TenantId {
    type Err = ReservoirError;

    fn from_str(s: &str) -> Result<Self> {
        if !TENANT_PATTERN.is_match(s) {
            return Err(ReservoirError::validation(format!(
                "tenant '{s}' does not match {}",
                TENANT_PATTERN.as_str()
            )));
        }
        Ok(Self(s.to_string()))
    }
}

impl std::fmt::Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Datestamps
// ---------------------------------------------------------------------------

/// Current time as cluster datestamp (microseconds since the Unix epoch).
pub fn datestamp_now() -> i64 {
    Utc::now().timestamp_micros()
}

/// Convert a stored datestamp to a UTC timestamp.
pub fn datestamp_to_utc(micros: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp_micros(micros)
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// One per-source version of a bibliographic record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalRecord {
    #[serde(rename = "globalId")]
    pub id: RecordId,
    pub local_id: String,
    pub source_id: String,
    pub source_version: i64,
    pub payload: serde_json::Value,
}

/// A record as delivered by an ingest batch.
///
/// `sourceId`/`sourceVersion` are supplied per batch, not per record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub delete: bool,
}

impl IngestRecord {
    /// Interpret one decoded JSON value as an ingest record.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value)
            .map_err(|e| ReservoirError::validation(format!("malformed record: {e}")))
    }

    /// A record upsert.
    pub fn upsert(local_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            local_id: Some(local_id.into()),
            payload: Some(payload),
            delete: false,
        }
    }

    /// A record deletion.
    pub fn delete(local_id: impl Into<String>) -> Self {
        Self {
            local_id: Some(local_id.into()),
            payload: None,
            delete: true,
        }
    }
}

/// What happened to one ingested record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Inserted,
    Updated,
    Deleted,
    /// Nothing to do, e.g. a delete of a record that is not stored.
    Ignored,
}

// ---------------------------------------------------------------------------
// Match key configuration
// ---------------------------------------------------------------------------

/// A named strategy + params for deriving match values from a payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchKeyConfig {
    /// User-chosen identifier (e.g. `isbn`).
    pub id: String,
    /// Extraction method name (e.g. `jsonpath`).
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: serde_json::Value,
    /// Update strategy; [`UPDATE_MANUAL`] disables computation on ingest.
    #[serde(default = "default_update")]
    pub update: String,
}

fn default_update() -> String {
    UPDATE_INGEST.into()
}

impl MatchKeyConfig {
    /// Whether ingest should compute values for this config.
    pub fn is_automatic(&self) -> bool {
        self.update != UPDATE_MANUAL
    }
}

// ---------------------------------------------------------------------------
// Clusters (read side)
// ---------------------------------------------------------------------------

/// Last-changed marker of one cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterMeta {
    pub cluster_id: ClusterId,
    pub match_key_config_id: String,
    /// Microseconds since the Unix epoch.
    pub datestamp: i64,
}

/// A cluster as presented to downstream consumers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub cluster_id: ClusterId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub datestamp: Option<DateTime<Utc>>,
    pub records: Vec<GlobalRecord>,
    pub match_values: Vec<String>,
}

impl Cluster {
    /// Build a cluster view.
    ///
    /// Only the latest version of each source is kept. Records are sorted by
    /// (sourceId, sourceVersion, localId), match values lexically.
    pub fn new(
        cluster_id: ClusterId,
        datestamp: Option<i64>,
        mut records: Vec<GlobalRecord>,
        mut match_values: Vec<String>,
    ) -> Self {
        retain_latest_versions(&mut records);
        records.sort_by(|a, b| {
            a.source_id
                .cmp(&b.source_id)
                .then(a.source_version.cmp(&b.source_version))
                .then_with(|| a.local_id.cmp(&b.local_id))
        });
        match_values.sort();
        match_values.dedup();
        Self {
            cluster_id,
            datestamp: datestamp.and_then(datestamp_to_utc),
            records,
            match_values,
        }
    }
}

/// Drop records whose source has a newer version in the same set.
fn retain_latest_versions(records: &mut Vec<GlobalRecord>) {
    let mut latest: HashMap<String, i64> = HashMap::new();
    for r in records.iter() {
        latest
            .entry(r.source_id.clone())
            .and_modify(|v| *v = (*v).max(r.source_version))
            .or_insert(r.source_version);
    }
    records.retain(|r| latest.get(&r.source_id) == Some(&r.source_version));
}

/// Clustering statistics for one match key config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchKeyStats {
    pub records_total: u64,
    pub clusters_total: u64,
    /// Number of match values in a cluster → number of such clusters.
    pub match_values_per_cluster: std::collections::BTreeMap<u64, u64>,
    /// Number of records in a cluster → number of such clusters.
    pub records_per_cluster: std::collections::BTreeMap<u64, u64>,
    /// Up to three sample cluster ids for each records-per-cluster size.
    pub records_per_cluster_sample: std::collections::BTreeMap<u64, Vec<ClusterId>>,
}
