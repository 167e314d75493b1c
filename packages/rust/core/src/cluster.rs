//! The clustering engine.
//!
//! Assigns a record to the cluster owning any of its match values, creating
//! or merging clusters as needed. Runs inside the caller's transaction; the
//! caller owns retry.

use std::collections::BTreeSet;

use reservoir_shared::{ClusterId, RecordId, Result, datestamp_now};
use reservoir_storage::Connection;
use reservoir_storage::clusters;
use tracing::{debug, instrument};

/// Where a record ended up under one match key config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterAssignment {
    /// The cluster now holding the record.
    pub cluster_id: ClusterId,
    /// Whether that cluster was minted for this record.
    pub created: bool,
    /// Clusters merged into `cluster_id`, ascending.
    pub merged: Vec<ClusterId>,
}

/// Assign `record_id` to a cluster under `match_key_config_id`.
///
/// 1. Find the clusters owning any of `values`.
/// 2. None: mint a cluster. Otherwise the smallest id wins and every owner
///    gets its datestamp advanced.
/// 3. Retarget the other owners' values and members to the winner.
/// 4. Add the values nobody owns yet, then point the membership at the winner.
///
/// An empty value set always yields a fresh singleton cluster.
#[instrument(level = "debug", skip_all, fields(record = %record_id, match_key = %match_key_config_id))]
pub async fn assign_cluster(
    conn: &Connection,
    record_id: &RecordId,
    match_key_config_id: &str,
    values: &BTreeSet<String>,
) -> Result<ClusterAssignment> {
    let now = datestamp_now();
    let owners = clusters::lookup_value_owners(conn, match_key_config_id, values).await?;
    let owning: BTreeSet<ClusterId> = owners.values().copied().collect();
    let previous = clusters::cluster_of_record(conn, record_id, match_key_config_id).await?;

    let assignment = match owning.first().copied() {
        None => {
            let cluster_id = ClusterId::new();
            clusters::create_cluster_meta(conn, &cluster_id, match_key_config_id, now).await?;
            ClusterAssignment {
                cluster_id,
                created: true,
                merged: Vec::new(),
            }
        }
        Some(winner) => {
            clusters::advance_cluster_meta(conn, &owning, now).await?;
            let losers: BTreeSet<ClusterId> =
                owning.iter().copied().filter(|c| *c != winner).collect();
            if !losers.is_empty() {
                clusters::merge_clusters(conn, match_key_config_id, &winner, &losers).await?;
                debug!(%winner, merged = losers.len(), "merged clusters");
            }
            ClusterAssignment {
                cluster_id: winner,
                created: false,
                merged: losers.into_iter().collect(),
            }
        }
    };

    // A record leaving its old cluster changes that cluster too.
    if let Some(previous) = previous {
        if previous != assignment.cluster_id && !owning.contains(&previous) {
            clusters::advance_cluster_meta(conn, &BTreeSet::from([previous]), now).await?;
        }
    }

    let new_values: Vec<&String> = values.iter().filter(|v| !owners.contains_key(*v)).collect();
    clusters::insert_cluster_values(conn, match_key_config_id, &assignment.cluster_id, new_values)
        .await?;
    clusters::upsert_membership(conn, record_id, match_key_config_id, &assignment.cluster_id)
        .await?;

    Ok(assignment)
}

/// Cut every value to at most `max_len` characters.
///
/// Distinct values sharing a prefix collapse into one.
pub fn truncate_match_values(values: BTreeSet<String>, max_len: usize) -> BTreeSet<String> {
    values
        .into_iter()
        .map(|v| match v.char_indices().nth(max_len) {
            Some((cut, _)) => v[..cut].to_string(),
            None => v,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::with_retry;
    use crate::test_support::*;
    use reservoir_shared::{ReservoirError, SourceId};
    use reservoir_storage::Storage;
    use reservoir_storage::records::upsert_global_record;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn set(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    async fn record(conn: &Connection, local_id: &str) -> RecordId {
        let source: SourceId = "S1".parse().unwrap();
        upsert_global_record(conn, local_id, &source, 1, &json!({}))
            .await
            .unwrap()
            .0
    }

    #[tokio::test]
    async fn disjoint_values_get_own_clusters() {
        let storage = test_storage().await;
        let conn = storage.connect().await.unwrap();
        let a = record(&conn, "a").await;
        let b = record(&conn, "b").await;

        let ca = assign_cluster(&conn, &a, "isbn", &set(&["x"])).await.unwrap();
        let cb = assign_cluster(&conn, &b, "isbn", &set(&["y"])).await.unwrap();
        assert!(ca.created && cb.created);
        assert_ne!(ca.cluster_id, cb.cluster_id);
    }

    #[tokio::test]
    async fn shared_value_joins_existing_cluster() {
        let storage = test_storage().await;
        let conn = storage.connect().await.unwrap();
        let a = record(&conn, "a").await;
        let b = record(&conn, "b").await;

        let ca = assign_cluster(&conn, &a, "isbn", &set(&["x"])).await.unwrap();
        let before = storage.get_cluster_meta(&ca.cluster_id).await.unwrap().unwrap();

        let cb = assign_cluster(&conn, &b, "isbn", &set(&["x", "z"])).await.unwrap();
        assert!(!cb.created);
        assert_eq!(cb.cluster_id, ca.cluster_id);

        let after = storage.get_cluster_meta(&ca.cluster_id).await.unwrap().unwrap();
        assert!(after.datestamp > before.datestamp);

        let cluster = storage.get_cluster_by_id(&ca.cluster_id).await.unwrap().unwrap();
        assert_eq!(cluster.match_values, vec!["x", "z"]);
        assert_eq!(cluster.records.len(), 2);
    }

    #[tokio::test]
    async fn bridging_record_merges_into_smallest_id() {
        let storage = test_storage().await;
        let conn = storage.connect().await.unwrap();
        let a = record(&conn, "a").await;
        let b = record(&conn, "b").await;
        let c = record(&conn, "c").await;

        let ca = assign_cluster(&conn, &a, "isbn", &set(&["x"])).await.unwrap();
        let cb = assign_cluster(&conn, &b, "isbn", &set(&["y"])).await.unwrap();
        let cc = assign_cluster(&conn, &c, "isbn", &set(&["x", "y"])).await.unwrap();

        let winner = ca.cluster_id.min(cb.cluster_id);
        let loser = ca.cluster_id.max(cb.cluster_id);
        assert_eq!(cc.cluster_id, winner);
        assert_eq!(cc.merged, vec![loser]);

        for r in [a, b, c] {
            assert_eq!(
                storage.cluster_of_record(&r, "isbn").await.unwrap(),
                Some(winner)
            );
        }
        let (values, members, _) = storage.cluster_row_counts("isbn").await.unwrap();
        assert_eq!((values, members), (2, 3));
    }

    #[tokio::test]
    async fn empty_values_make_singletons() {
        let storage = test_storage().await;
        let conn = storage.connect().await.unwrap();
        let a = record(&conn, "a").await;
        let b = record(&conn, "b").await;

        let ca = assign_cluster(&conn, &a, "isbn", &BTreeSet::new()).await.unwrap();
        let cb = assign_cluster(&conn, &b, "isbn", &BTreeSet::new()).await.unwrap();
        assert!(ca.created && cb.created);
        assert_ne!(ca.cluster_id, cb.cluster_id);
    }

    #[tokio::test]
    async fn reassigning_same_values_is_stable() {
        let storage = test_storage().await;
        let conn = storage.connect().await.unwrap();
        let a = record(&conn, "a").await;

        let first = assign_cluster(&conn, &a, "isbn", &set(&["x"])).await.unwrap();
        let again = assign_cluster(&conn, &a, "isbn", &set(&["x"])).await.unwrap();
        assert_eq!(first.cluster_id, again.cluster_id);
        assert!(!again.created);
        assert_eq!(storage.cluster_row_counts("isbn").await.unwrap(), (1, 1, 1));
    }

    #[tokio::test]
    async fn moving_record_touches_old_cluster() {
        let storage = test_storage().await;
        let conn = storage.connect().await.unwrap();
        let a = record(&conn, "a").await;

        let old = assign_cluster(&conn, &a, "isbn", &set(&["x"])).await.unwrap();
        let before = storage.get_cluster_meta(&old.cluster_id).await.unwrap().unwrap();

        let new = assign_cluster(&conn, &a, "isbn", &set(&["y"])).await.unwrap();
        assert_ne!(new.cluster_id, old.cluster_id);

        let after = storage.get_cluster_meta(&old.cluster_id).await.unwrap().unwrap();
        assert!(after.datestamp > before.datestamp);
        let stale = storage.get_cluster_by_id(&old.cluster_id).await.unwrap().unwrap();
        assert!(stale.records.is_empty());
        assert_eq!(stale.match_values, vec!["x"]);
    }

    /// Assign in a write transaction of its own, committing on success.
    async fn assign_committed(
        storage: &Storage,
        record_id: &RecordId,
        values: &BTreeSet<String>,
    ) -> Result<ClusterAssignment> {
        let tx = storage.begin_write().await?;
        match assign_cluster(&tx, record_id, "isbn", values).await {
            Ok(assignment) => {
                reservoir_storage::commit(tx).await?;
                Ok(assignment)
            }
            Err(e) => {
                reservoir_storage::rollback(tx).await;
                Err(e)
            }
        }
    }

    /// Mint a cluster for `values` from an owner lookup taken earlier.
    async fn assign_from_lookup(
        storage: &Storage,
        seen: &BTreeMap<String, ClusterId>,
        values: &BTreeSet<String>,
    ) -> Result<ClusterAssignment> {
        let tx = storage.begin_write().await?;
        let cluster_id = ClusterId::new();
        let result = async {
            clusters::create_cluster_meta(&tx, &cluster_id, "isbn", datestamp_now()).await?;
            let unowned: Vec<&String> = values.iter().filter(|v| !seen.contains_key(*v)).collect();
            clusters::insert_cluster_values(&tx, "isbn", &cluster_id, unowned).await
        }
        .await;
        match result {
            Ok(()) => {
                reservoir_storage::commit(tx).await?;
                Ok(ClusterAssignment {
                    cluster_id,
                    created: true,
                    merged: Vec::new(),
                })
            }
            Err(e) => {
                reservoir_storage::rollback(tx).await;
                Err(e)
            }
        }
    }

    #[tokio::test]
    async fn racing_new_value_conflicts_then_joins_on_retry() {
        let storage = test_storage().await;
        let setup = storage.connect().await.unwrap();
        let a = record(&setup, "a").await;
        let b = record(&setup, "b").await;
        let values = set(&["111"]);

        // The second writer looks the value up before the first one stores it.
        let reader = storage.connect().await.unwrap();
        let seen = clusters::lookup_value_owners(&reader, "isbn", &values)
            .await
            .unwrap();
        assert!(seen.is_empty());

        let first = assign_committed(&storage, &a, &values).await.unwrap();
        assert!(first.created);

        let err = assign_from_lookup(&storage, &seen, &values).await.unwrap_err();
        assert!(matches!(err, ReservoirError::Conflict(_)), "got {err:?}");

        let attempts = AtomicUsize::new(0);
        let second = with_retry(1, |attempt| {
            attempts.fetch_add(1, Ordering::SeqCst);
            let (storage, seen, values, b) = (&storage, &seen, &values, &b);
            async move {
                if attempt == 0 {
                    assign_from_lookup(storage, seen, values).await
                } else {
                    assign_committed(storage, b, values).await
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(second.cluster_id, first.cluster_id);
        assert!(!second.created);
        assert_eq!(storage.cluster_row_counts("isbn").await.unwrap(), (1, 2, 1));
    }

    #[tokio::test]
    async fn assignment_runs_on_spawned_task() {
        let storage = Arc::new(test_storage().await);
        let setup = storage.connect().await.unwrap();
        let a = record(&setup, "a").await;

        let task_storage = storage.clone();
        let assignment = tokio::spawn(async move {
            let conn = task_storage.connect().await?;
            assign_cluster(&conn, &a, "isbn", &set(&["x", "y"])).await
        })
        .await
        .unwrap()
        .unwrap();

        assert!(assignment.created);
        assert_eq!(storage.cluster_row_counts("isbn").await.unwrap(), (2, 1, 1));
    }

    #[test]
    fn truncation_counts_characters() {
        let values = set(&["abcdef", "abcxyz", "åäöåäö", "ab"]);
        let cut = truncate_match_values(values, 3);
        assert_eq!(cut, set(&["abc", "åäö", "ab"]));
    }
}
