//! libSQL storage layer for one tenant's record reservoir.
//!
//! The [`Storage`] struct wraps a libSQL database holding global records,
//! match key configurations, and the cluster tables (values, memberships,
//! meta).
//!
//! **Access rules:**
//! - Every per-record write pipeline takes its own connection via
//!   [`Storage::begin_write`] and never shares it with another record.
//! - Harvesting/search readers may use [`Storage::open_readonly`].
//!
//! The free functions in [`records`] and [`clusters`] take a `&Connection`
//! so that callers decide the transaction scope.

pub mod clusters;
mod migrations;
pub mod records;

use std::path::Path;
use std::time::Duration;

use libsql::{Database, TransactionBehavior, params};
use reservoir_shared::{
    Cluster, ClusterId, ClusterMeta, GlobalRecord, MatchKeyConfig, MatchKeyStats, RecordId,
    ReservoirError, Result, SourceId, StorageConfig, TenantId,
};

pub use libsql::{Connection, Transaction};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    db: Database,
    conn: Connection,
    tenant: TenantId,
    busy_timeout: Duration,
    fetch_size: u32,
    readonly: bool,
}

impl Storage {
    /// Open or create a tenant database at `path` in read-write mode.
    pub async fn open(path: &Path, tenant: TenantId) -> Result<Self> {
        Self::open_with_config(path, tenant, &StorageConfig::default()).await
    }

    /// Open or create a tenant database using explicit storage settings.
    pub async fn open_with_config(
        path: &Path,
        tenant: TenantId,
        config: &StorageConfig,
    ) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ReservoirError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let busy_timeout = Duration::from_millis(config.busy_timeout_ms);
        let conn = prepare_connection(&db, busy_timeout).await?;

        // WAL lets readers proceed while a per-record transaction writes.
        let mut rows = conn
            .query("PRAGMA journal_mode = WAL", params![])
            .await
            .map_err(db_err)?;
        while rows.next().await.map_err(db_err)?.is_some() {}

        let storage = Self {
            db,
            conn,
            tenant,
            busy_timeout,
            fetch_size: config.fetch_size.max(1),
            readonly: false,
        };
        storage.run_migrations().await?;
        tracing::debug!(tenant = %storage.tenant, path = %path.display(), "storage opened");
        Ok(storage)
    }

    /// Open a tenant database at `path` in read-only mode (for harvesting readers).
    pub async fn open_readonly(path: &Path, tenant: TenantId) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let busy_timeout = Duration::from_millis(StorageConfig::default().busy_timeout_ms);
        let conn = prepare_connection(&db, busy_timeout).await?;

        Ok(Self {
            db,
            conn,
            tenant,
            busy_timeout,
            fetch_size: StorageConfig::default().fetch_size,
            readonly: true,
        })
    }

    /// Tenant owning this database.
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    /// Rows per cursor page for bulk scans.
    pub fn fetch_size(&self) -> u32 {
        self.fetch_size
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        ReservoirError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(ReservoirError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Connections & transactions
    // -----------------------------------------------------------------------

    /// A fresh connection owned by one caller.
    pub async fn connect(&self) -> Result<Connection> {
        prepare_connection(&self.db, self.busy_timeout).await
    }

    /// Begin a write transaction on a fresh connection.
    ///
    /// The write lock is taken up front, so two pipelines never both read and
    /// then upgrade; the loser waits up to the busy timeout instead.
    pub async fn begin_write(&self) -> Result<Transaction> {
        self.check_writable()?;
        let conn = self.connect().await?;
        conn.transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(db_err)
    }

    // -----------------------------------------------------------------------
    // Match key configs
    // -----------------------------------------------------------------------

    /// Insert a new match key config. Fails with a conflict if the id exists.
    pub async fn insert_match_key_config(&self, config: &MatchKeyConfig) -> Result<()> {
        self.check_writable()?;
        let params_json = serde_json::to_string(&config.params)
            .map_err(|e| ReservoirError::Storage(e.to_string()))?;
        self.conn
            .execute(
                "INSERT INTO match_key_config (id, method, params, update_strategy)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    config.id.as_str(),
                    config.method.as_str(),
                    params_json,
                    config.update.as_str()
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Update an existing match key config. Returns `false` if not found.
    pub async fn update_match_key_config(&self, config: &MatchKeyConfig) -> Result<bool> {
        self.check_writable()?;
        let params_json = serde_json::to_string(&config.params)
            .map_err(|e| ReservoirError::Storage(e.to_string()))?;
        let changed = self
            .conn
            .execute(
                "UPDATE match_key_config SET method = ?2, params = ?3, update_strategy = ?4
                 WHERE id = ?1",
                params![
                    config.id.as_str(),
                    config.method.as_str(),
                    params_json,
                    config.update.as_str()
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    /// Get a match key config by id.
    pub async fn get_match_key_config(&self, id: &str) -> Result<Option<MatchKeyConfig>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, method, params, update_strategy FROM match_key_config WHERE id = ?1",
                params![id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_match_key_config(&row)?)),
            None => Ok(None),
        }
    }

    /// List all match key configs ordered by id.
    pub async fn list_match_key_configs(&self) -> Result<Vec<MatchKeyConfig>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, method, params, update_strategy FROM match_key_config ORDER BY id",
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_match_key_config(&row)?);
        }
        Ok(results)
    }

    /// Delete a match key config and, by cascade, all of its cluster rows.
    /// Returns `false` if not found.
    pub async fn delete_match_key_config(&self, id: &str) -> Result<bool> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute("DELETE FROM match_key_config WHERE id = ?1", params![id])
            .await
            .map_err(db_err)?;
        Ok(changed > 0)
    }

    // -----------------------------------------------------------------------
    // Global records (outside any per-record pipeline)
    // -----------------------------------------------------------------------

    /// Get one global record by id.
    pub async fn get_global_record(&self, id: &RecordId) -> Result<Option<GlobalRecord>> {
        records::get_global_record(&self.conn, id).await
    }

    /// List global records, optionally restricted to one source.
    pub async fn list_global_records(
        &self,
        source_id: Option<&SourceId>,
    ) -> Result<Vec<GlobalRecord>> {
        records::list_global_records(&self.conn, source_id).await
    }

    /// Delete every record of a source in one transaction. Returns the count.
    pub async fn delete_source(&self, source_id: &SourceId) -> Result<u64> {
        let tx = self.begin_write().await?;
        let result = records::delete_source(&tx, source_id, reservoir_shared::datestamp_now()).await;
        match result {
            Ok(n) => {
                commit(tx).await?;
                tracing::info!(source_id = %source_id, deleted = n, "deleted source records");
                Ok(n)
            }
            Err(e) => {
                rollback(tx).await;
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Cluster reads
    // -----------------------------------------------------------------------

    /// Get a cluster with its latest-version records and match values.
    pub async fn get_cluster_by_id(&self, cluster_id: &ClusterId) -> Result<Option<Cluster>> {
        clusters::get_cluster(&self.conn, cluster_id).await
    }

    /// Clusters of one config changed at or after `since`, in cursor order.
    ///
    /// Pass the last returned cluster id as `after` (with its datestamp as
    /// `since`) to continue a page.
    pub async fn get_clusters_changed_since(
        &self,
        match_key_config_id: &str,
        since: i64,
        after: Option<&ClusterId>,
        limit: u32,
    ) -> Result<Vec<ClusterMeta>> {
        clusters::changed_since(&self.conn, match_key_config_id, since, after, limit).await
    }

    /// Meta row of a cluster.
    pub async fn get_cluster_meta(&self, cluster_id: &ClusterId) -> Result<Option<ClusterMeta>> {
        clusters::get_meta(&self.conn, cluster_id).await
    }

    /// Cluster a record belongs to under one config.
    pub async fn cluster_of_record(
        &self,
        record_id: &RecordId,
        match_key_config_id: &str,
    ) -> Result<Option<ClusterId>> {
        clusters::cluster_of_record(&self.conn, record_id, match_key_config_id).await
    }

    /// Cluster owning a match value under one config.
    pub async fn cluster_of_value(
        &self,
        match_key_config_id: &str,
        match_value: &str,
    ) -> Result<Option<ClusterId>> {
        clusters::cluster_of_value(&self.conn, match_key_config_id, match_value).await
    }

    /// Row counts `(values, memberships, metas)` for one config.
    pub async fn cluster_row_counts(&self, match_key_config_id: &str) -> Result<(u64, u64, u64)> {
        clusters::row_counts(&self.conn, match_key_config_id).await
    }

    /// Clustering statistics for one config.
    pub async fn stats_match_key(&self, match_key_config_id: &str) -> Result<MatchKeyStats> {
        clusters::stats(&self.conn, match_key_config_id).await
    }

    /// Remove all cluster rows of one config (precondition for a clean rebuild).
    pub async fn clear_cluster_state(&self, match_key_config_id: &str) -> Result<()> {
        let tx = self.begin_write().await?;
        let result = clusters::clear(&tx, match_key_config_id).await;
        match result {
            Ok(()) => commit(tx).await,
            Err(e) => {
                rollback(tx).await;
                Err(e)
            }
        }
    }
}

/// Commit a write transaction.
pub async fn commit(tx: Transaction) -> Result<()> {
    tx.commit().await.map_err(db_err)
}

/// Roll back a write transaction. A failed rollback is only logged.
pub async fn rollback(tx: Transaction) {
    if let Err(e) = tx.rollback().await {
        tracing::warn!(error = %e, "rollback failed");
    }
}

/// Open a named savepoint inside the current transaction.
pub async fn savepoint(conn: &Connection, name: &str) -> Result<()> {
    conn.execute(&format!("SAVEPOINT {name}"), params![])
        .await
        .map_err(db_err)?;
    Ok(())
}

/// Keep the work done since `savepoint(name)`.
pub async fn release_savepoint(conn: &Connection, name: &str) -> Result<()> {
    conn.execute(&format!("RELEASE {name}"), params![])
        .await
        .map_err(db_err)?;
    Ok(())
}

/// Undo the work done since `savepoint(name)` and close the savepoint.
pub async fn rollback_to_savepoint(conn: &Connection, name: &str) -> Result<()> {
    conn.execute(&format!("ROLLBACK TO {name}"), params![])
        .await
        .map_err(db_err)?;
    release_savepoint(conn, name).await
}

/// Open a connection with the per-connection pragmas applied.
async fn prepare_connection(db: &Database, busy_timeout: Duration) -> Result<Connection> {
    let conn = db.connect().map_err(db_err)?;
    for pragma in [
        "PRAGMA foreign_keys = ON".to_string(),
        format!("PRAGMA busy_timeout = {}", busy_timeout.as_millis()),
    ] {
        let mut rows = conn.query(&pragma, params![]).await.map_err(db_err)?;
        while rows.next().await.map_err(db_err)?.is_some() {}
    }
    Ok(conn)
}

/// Map a libSQL error, singling out uniqueness violations as conflicts.
pub fn db_err(e: libsql::Error) -> ReservoirError {
    let message = e.to_string();
    if message.contains("UNIQUE constraint failed") {
        ReservoirError::Conflict(message)
    } else {
        ReservoirError::Storage(message)
    }
}

/// Parse a stored identifier column.
pub(crate) fn parse_id<T: std::str::FromStr>(value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| ReservoirError::Storage(format!("invalid id '{value}': {e}")))
}

/// Convert a database row to a [`MatchKeyConfig`].
fn row_to_match_key_config(row: &libsql::Row) -> Result<MatchKeyConfig> {
    let params: String = row.get(2).map_err(db_err)?;
    Ok(MatchKeyConfig {
        id: row.get::<String>(0).map_err(db_err)?,
        method: row.get::<String>(1).map_err(db_err)?,
        params: serde_json::from_str(&params)
            .map_err(|e| ReservoirError::Storage(format!("invalid params JSON: {e}")))?,
        update: row.get::<String>(3).map_err(db_err)?,
    })
}

/// Temp-file storage shared by the tests of this crate.
#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use uuid::Uuid;

    pub(crate) async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("reservoir_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp, "test".parse().unwrap())
            .await
            .expect("open test db")
    }

    pub(crate) fn isbn_config() -> MatchKeyConfig {
        MatchKeyConfig {
            id: "isbn".into(),
            method: "jsonpath".into(),
            params: serde_json::json!({"expr": "$.identifiers[*].isbn"}),
            update: "ingest".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use uuid::Uuid;

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("reservoir_test_{}.db", Uuid::now_v7()));
        let s1 = Storage::open(&tmp, "test".parse().unwrap())
            .await
            .expect("first open");
        drop(s1);
        let s2 = Storage::open(&tmp, "test".parse().unwrap())
            .await
            .expect("second open");
        assert_eq!(s2.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn match_key_config_crud() {
        let storage = test_storage().await;
        let config = isbn_config();

        storage
            .insert_match_key_config(&config)
            .await
            .expect("insert config");

        let found = storage.get_match_key_config("isbn").await.expect("get");
        assert_eq!(found.as_ref(), Some(&config));

        let dup = storage.insert_match_key_config(&config).await.unwrap_err();
        assert!(matches!(dup, ReservoirError::Conflict(_)), "got {dup:?}");

        let manual = MatchKeyConfig {
            update: "manual".into(),
            ..config.clone()
        };
        assert!(storage.update_match_key_config(&manual).await.unwrap());
        let found = storage.get_match_key_config("isbn").await.unwrap().unwrap();
        assert!(!found.is_automatic());

        let missing = MatchKeyConfig {
            id: "title".into(),
            ..config
        };
        assert!(!storage.update_match_key_config(&missing).await.unwrap());

        assert_eq!(storage.list_match_key_configs().await.unwrap().len(), 1);
        assert!(storage.delete_match_key_config("isbn").await.unwrap());
        assert!(!storage.delete_match_key_config("isbn").await.unwrap());
        assert!(storage.get_match_key_config("isbn").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("reservoir_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp, "test".parse().unwrap()).await.unwrap();
        rw.insert_match_key_config(&isbn_config()).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp, "test".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(ro.list_match_key_configs().await.unwrap().len(), 1);
        let result = ro
            .insert_match_key_config(&MatchKeyConfig {
                id: "title".into(),
                ..isbn_config()
            })
            .await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
        assert!(ro.begin_write().await.is_err());
    }
}
