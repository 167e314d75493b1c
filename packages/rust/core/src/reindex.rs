//! Bulk reindex: recompute one match key over every stored record.
//!
//! Runs in a single transaction, paging through `global_records` by id. Each
//! row is clustered inside its own savepoint; a failing row is logged,
//! counted and rolled back, and the run goes on. Only a failure of the scan
//! itself aborts (and rolls back) the run.
//!
//! Existing cluster rows of the config are not removed first; call
//! [`Storage::clear_cluster_state`] for a clean rebuild.

use std::time::Instant;

use reservoir_matchkey::{MatchKeyMethod, MethodCache};
use reservoir_shared::{GlobalRecord, RecordId, Result};
use reservoir_storage::{self as storage, Connection, Storage, records};
use serde::Serialize;
use tracing::{error, info, instrument};

use crate::cluster::{assign_cluster, truncate_match_values};
use crate::pipeline::ProgressReporter;

const ROW_SAVEPOINT: &str = "reindex_row";

/// Outcome of a reindex run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReindexStats {
    pub total_records: u64,
    pub failed_records: u64,
}

/// Recompute `match_key_config_id` for all records.
///
/// Returns `None` if the config does not exist.
#[instrument(skip_all, fields(tenant = %store.tenant(), match_key = %match_key_config_id))]
pub async fn initialize_match_key(
    store: &Storage,
    cache: &MethodCache,
    match_key_config_id: &str,
    max_len: usize,
    progress: &dyn ProgressReporter,
) -> Result<Option<ReindexStats>> {
    let Some(config) = store.get_match_key_config(match_key_config_id).await? else {
        return Ok(None);
    };
    let method = cache.get(store.tenant(), &config)?;
    let start = Instant::now();
    progress.phase("Reindexing records");

    let tx = store.begin_write().await?;
    let result = reindex_all(
        &tx,
        store.fetch_size(),
        &config.id,
        method.as_ref(),
        max_len,
        progress,
    )
    .await;

    match result {
        Ok(stats) => {
            storage::commit(tx).await?;
            info!(
                total = stats.total_records,
                failed = stats.failed_records,
                duration_ms = start.elapsed().as_millis(),
                "reindex completed"
            );
            Ok(Some(stats))
        }
        Err(e) => {
            error!(error = %e, "reindex aborted");
            storage::rollback(tx).await;
            Err(e)
        }
    }
}

/// Page through every record and cluster it, one savepoint per row.
pub(crate) async fn reindex_all(
    conn: &Connection,
    fetch_size: u32,
    match_key_config_id: &str,
    method: &dyn MatchKeyMethod,
    max_len: usize,
    progress: &dyn ProgressReporter,
) -> Result<ReindexStats> {
    let mut stats = ReindexStats::default();
    let mut after: Option<RecordId> = None;

    loop {
        let page = records::page_global_records(conn, after.as_ref(), fetch_size).await?;
        let Some(last) = page.last() else {
            break;
        };
        after = Some(last.id);

        for record in &page {
            stats.total_records += 1;
            storage::savepoint(conn, ROW_SAVEPOINT).await?;
            match reindex_row(conn, match_key_config_id, method, max_len, record).await {
                Ok(()) => storage::release_savepoint(conn, ROW_SAVEPOINT).await?,
                Err(e) => {
                    error!(record = %record.id, error = %e, "reindex failed for record");
                    stats.failed_records += 1;
                    storage::rollback_to_savepoint(conn, ROW_SAVEPOINT).await?;
                }
            }
            progress.record_done(stats.total_records);
        }
    }
    Ok(stats)
}

async fn reindex_row(
    conn: &Connection,
    match_key_config_id: &str,
    method: &dyn MatchKeyMethod,
    max_len: usize,
    record: &GlobalRecord,
) -> Result<()> {
    let values = truncate_match_values(method.match_values(&record.payload)?, max_len);
    assign_cluster(conn, &record.id, match_key_config_id, &values).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::SilentProgress;
    use crate::test_support::*;
    use reservoir_shared::{MatchKeyConfig, ReservoirError, SourceId};
    use serde_json::{Value, json};
    use std::collections::BTreeSet;

    /// Extracts `$.isbn`, failing on payloads flagged `poison`.
    #[derive(Debug)]
    struct PoisonAware;

    impl MatchKeyMethod for PoisonAware {
        fn name(&self) -> &'static str {
            "poison-aware"
        }

        fn match_values(&self, payload: &Value) -> Result<BTreeSet<String>> {
            if payload.get("poison").is_some() {
                return Err(ReservoirError::match_key("poisoned payload"));
            }
            Ok(payload
                .get("isbn")
                .and_then(Value::as_str)
                .map(String::from)
                .into_iter()
                .collect())
        }
    }

    async fn seed(store: &Storage, payloads: &[(&str, Value)]) {
        let source: SourceId = "S1".parse().unwrap();
        let conn = store.connect().await.unwrap();
        for (local, payload) in payloads {
            records::upsert_global_record(&conn, local, &source, 1, payload)
                .await
                .unwrap();
        }
    }

    fn title_config() -> MatchKeyConfig {
        MatchKeyConfig {
            id: "title".into(),
            method: "jsonpath".into(),
            params: json!({ "expr": "$.title" }),
            update: "manual".into(),
        }
    }

    #[tokio::test]
    async fn unknown_config_is_none() {
        let store = test_storage().await;
        let result = initialize_match_key(&store, &MethodCache::new(), "nope", 600, &SilentProgress)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn clusters_existing_records_across_pages() {
        let store = test_storage().await;
        store.insert_match_key_config(&title_config()).await.unwrap();
        let payloads: Vec<(String, Value)> = (0..120)
            .map(|i| (format!("L{i}"), json!({ "title": format!("T{}", i % 7) })))
            .collect();
        let refs: Vec<(&str, Value)> = payloads
            .iter()
            .map(|(l, p)| (l.as_str(), p.clone()))
            .collect();
        seed(&store, &refs).await;

        let cache = MethodCache::new();
        let stats = initialize_match_key(&store, &cache, "title", 600, &SilentProgress)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats, ReindexStats { total_records: 120, failed_records: 0 });

        let mk = store.stats_match_key("title").await.unwrap();
        assert_eq!(mk.clusters_total, 7);
        assert_eq!(mk.records_total, 120);

        let again = initialize_match_key(&store, &cache, "title", 600, &SilentProgress)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.total_records, 120);
        let (values, members, metas) = store.cluster_row_counts("title").await.unwrap();
        assert_eq!((values, members, metas), (7, 120, 7));
    }

    #[tokio::test]
    async fn failing_rows_are_skipped() {
        let store = test_storage().await;
        seed(
            &store,
            &[
                ("a", json!({ "isbn": "1" })),
                ("b", json!({ "isbn": "1", "poison": true })),
                ("c", json!({ "isbn": "2" })),
            ],
        )
        .await;

        let tx = store.begin_write().await.unwrap();
        let stats = reindex_all(&tx, 2, "isbn", &PoisonAware, 600, &SilentProgress)
            .await
            .unwrap();
        storage::commit(tx).await.unwrap();

        assert_eq!(stats, ReindexStats { total_records: 3, failed_records: 1 });
        let (values, members, metas) = store.cluster_row_counts("isbn").await.unwrap();
        assert_eq!((values, members, metas), (2, 2, 2));
    }

    #[tokio::test]
    async fn clean_rebuild_after_clear() {
        let store = test_storage().await;
        seed(&store, &[("a", json!({ "identifiers": [{ "isbn": "1" }] }))]).await;
        let cache = MethodCache::new();

        initialize_match_key(&store, &cache, "isbn", 600, &SilentProgress)
            .await
            .unwrap();
        store.clear_cluster_state("isbn").await.unwrap();
        assert_eq!(store.cluster_row_counts("isbn").await.unwrap(), (0, 0, 0));

        initialize_match_key(&store, &cache, "isbn", 600, &SilentProgress)
            .await
            .unwrap();
        assert_eq!(store.cluster_row_counts("isbn").await.unwrap(), (1, 1, 1));
    }
}
