//! Shared types, error model, and configuration for Reservoir.
//!
//! This crate is the foundation depended on by all other Reservoir crates.
//! It provides:
//! - [`ReservoirError`] — the unified error type
//! - Domain types ([`GlobalRecord`], [`MatchKeyConfig`], [`Cluster`], [`ClusterId`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, IngestConfig, StorageConfig, config_dir, config_file_path, init_config,
    load_config, load_config_from,
};
pub use error::{ReservoirError, Result};
pub use types::{
    Cluster, ClusterId, ClusterMeta, GlobalRecord, IngestOutcome, IngestRecord, MatchKeyConfig,
    MatchKeyStats, RecordId, SourceId, TenantId, UPDATE_INGEST, UPDATE_MANUAL, datestamp_now,
    datestamp_to_utc,
};
