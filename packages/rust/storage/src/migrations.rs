//! SQL migration definitions for the Reservoir database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: global_records, match_key_config, cluster tables",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Per-source record copies
CREATE TABLE IF NOT EXISTS global_records (
    id             TEXT PRIMARY KEY,
    local_id       TEXT NOT NULL,
    source_id      TEXT NOT NULL,
    source_version INTEGER NOT NULL DEFAULT 1,
    payload        TEXT NOT NULL,
    UNIQUE(local_id, source_id, source_version)
);

CREATE INDEX IF NOT EXISTS idx_global_records_source
    ON global_records(source_id, source_version);

-- Match key configurations
CREATE TABLE IF NOT EXISTS match_key_config (
    id              TEXT PRIMARY KEY,
    method          TEXT NOT NULL,
    params          TEXT NOT NULL,
    update_strategy TEXT NOT NULL DEFAULT 'ingest'
);

-- Last-changed marker per cluster (datestamp in microseconds)
CREATE TABLE IF NOT EXISTS cluster_meta (
    cluster_id          TEXT PRIMARY KEY,
    match_key_config_id TEXT NOT NULL REFERENCES match_key_config(id) ON DELETE CASCADE,
    datestamp           INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cluster_meta_datestamp
    ON cluster_meta(match_key_config_id, datestamp, cluster_id);

-- Record membership: one cluster per record and config
CREATE TABLE IF NOT EXISTS cluster_records (
    record_id           TEXT NOT NULL REFERENCES global_records(id) ON DELETE CASCADE,
    match_key_config_id TEXT NOT NULL REFERENCES match_key_config(id) ON DELETE CASCADE,
    cluster_id          TEXT NOT NULL,
    UNIQUE(record_id, match_key_config_id)
);

CREATE INDEX IF NOT EXISTS idx_cluster_records_cluster ON cluster_records(cluster_id);

-- Match value ownership: one cluster per value and config
CREATE TABLE IF NOT EXISTS cluster_values (
    cluster_id          TEXT NOT NULL,
    match_key_config_id TEXT NOT NULL REFERENCES match_key_config(id) ON DELETE CASCADE,
    match_value         TEXT NOT NULL,
    UNIQUE(match_key_config_id, match_value)
);

CREATE INDEX IF NOT EXISTS idx_cluster_values_cluster ON cluster_values(cluster_id);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
