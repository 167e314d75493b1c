//! Cluster table statements: value ownership, membership, meta.
//!
//! The write functions are the primitives of the clustering engine and are
//! meant to run inside one per-record transaction.

use std::collections::{BTreeMap, BTreeSet};

use libsql::{Connection, Value, params};
use reservoir_shared::{Cluster, ClusterId, ClusterMeta, MatchKeyStats, RecordId, Result};

use crate::records::row_to_global_record;
use crate::{db_err, parse_id};

/// Bound parameters per `IN (...)` statement, below SQLite's variable limit.
const IN_CHUNK: usize = 500;

/// Sample cluster ids kept per records-per-cluster size.
const STATS_SAMPLE: usize = 3;

/// `?{first}, ?{first+1}, ...` for `n` parameters.
fn placeholders(first: usize, n: usize) -> String {
    (first..first + n)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

// ---------------------------------------------------------------------------
// Engine primitives
// ---------------------------------------------------------------------------

/// Clusters currently owning any of `values` under one config, per value.
pub async fn lookup_value_owners(
    conn: &Connection,
    match_key_config_id: &str,
    values: &BTreeSet<String>,
) -> Result<BTreeMap<String, ClusterId>> {
    let mut owners = BTreeMap::new();
    let values: Vec<&String> = values.iter().collect();

    for chunk in values.chunks(IN_CHUNK) {
        let sql = format!(
            "SELECT match_value, cluster_id FROM cluster_values
             WHERE match_key_config_id = ?1 AND match_value IN ({})",
            placeholders(2, chunk.len())
        );
        let mut args = Vec::with_capacity(chunk.len() + 1);
        args.push(Value::Text(match_key_config_id.to_string()));
        args.extend(chunk.iter().map(|v| Value::Text((*v).clone())));

        let mut rows = conn.query(&sql, args).await.map_err(db_err)?;
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let value: String = row.get(0).map_err(db_err)?;
            let cluster: ClusterId = parse_id(&row.get::<String>(1).map_err(db_err)?)?;
            owners.insert(value, cluster);
        }
    }
    Ok(owners)
}

/// Create the meta row of a fresh cluster.
pub async fn create_cluster_meta(
    conn: &Connection,
    cluster_id: &ClusterId,
    match_key_config_id: &str,
    now: i64,
) -> Result<()> {
    conn.execute(
        "INSERT INTO cluster_meta (cluster_id, match_key_config_id, datestamp)
         VALUES (?1, ?2, ?3)",
        params![cluster_id.to_string(), match_key_config_id, now],
    )
    .await
    .map_err(db_err)?;
    Ok(())
}

/// Advance the datestamp of every cluster in `clusters`.
///
/// The new value is strictly greater than the old one even when the clock
/// has not moved.
pub async fn advance_cluster_meta(
    conn: &Connection,
    clusters: &BTreeSet<ClusterId>,
    now: i64,
) -> Result<()> {
    let ids: Vec<&ClusterId> = clusters.iter().collect();
    for chunk in ids.chunks(IN_CHUNK) {
        let sql = format!(
            "UPDATE cluster_meta SET datestamp = MAX(datestamp + 1, ?1)
             WHERE cluster_id IN ({})",
            placeholders(2, chunk.len())
        );
        let mut args = Vec::with_capacity(chunk.len() + 1);
        args.push(Value::Integer(now));
        args.extend(chunk.iter().map(|id| Value::Text(id.to_string())));
        conn.execute(&sql, args).await.map_err(db_err)?;
    }
    Ok(())
}

/// Retarget every value and membership row of `losers` to `winner`.
///
/// The losers' meta rows stay, so harvesters see them change to empty.
pub async fn merge_clusters(
    conn: &Connection,
    match_key_config_id: &str,
    winner: &ClusterId,
    losers: &BTreeSet<ClusterId>,
) -> Result<()> {
    let ids: Vec<&ClusterId> = losers.iter().collect();
    for chunk in ids.chunks(IN_CHUNK) {
        let mut args = Vec::with_capacity(chunk.len() + 2);
        args.push(Value::Text(winner.to_string()));
        args.push(Value::Text(match_key_config_id.to_string()));
        args.extend(chunk.iter().map(|id| Value::Text(id.to_string())));

        for table in ["cluster_values", "cluster_records"] {
            let sql = format!(
                "UPDATE {table} SET cluster_id = ?1
                 WHERE match_key_config_id = ?2 AND cluster_id IN ({})",
                placeholders(3, chunk.len())
            );
            conn.execute(&sql, args.clone()).await.map_err(db_err)?;
        }
    }
    Ok(())
}

/// Insert match values owned by `cluster_id`.
///
/// A value already owned by any cluster violates uniqueness and surfaces as
/// a conflict.
pub async fn insert_cluster_values<'a>(
    conn: &Connection,
    match_key_config_id: &str,
    cluster_id: &ClusterId,
    values: impl IntoIterator<Item = &'a String>,
) -> Result<()> {
    let cluster = cluster_id.to_string();
    for value in values {
        conn.execute(
            "INSERT INTO cluster_values (cluster_id, match_key_config_id, match_value)
             VALUES (?1, ?2, ?3)",
            params![cluster.as_str(), match_key_config_id, value.as_str()],
        )
        .await
        .map_err(db_err)?;
    }
    Ok(())
}

/// Point the record's membership under one config at `cluster_id`.
pub async fn upsert_membership(
    conn: &Connection,
    record_id: &RecordId,
    match_key_config_id: &str,
    cluster_id: &ClusterId,
) -> Result<()> {
    conn.execute(
        "INSERT INTO cluster_records (record_id, match_key_config_id, cluster_id)
         VALUES (?1, ?2, ?3)
         ON CONFLICT (record_id, match_key_config_id)
         DO UPDATE SET cluster_id = excluded.cluster_id",
        params![
            record_id.to_string(),
            match_key_config_id,
            cluster_id.to_string()
        ],
    )
    .await
    .map_err(db_err)?;
    Ok(())
}

/// Delete every value, membership and meta row of one config.
pub async fn clear(conn: &Connection, match_key_config_id: &str) -> Result<()> {
    for table in ["cluster_values", "cluster_records", "cluster_meta"] {
        conn.execute(
            &format!("DELETE FROM {table} WHERE match_key_config_id = ?1"),
            params![match_key_config_id],
        )
        .await
        .map_err(db_err)?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Read side
// ---------------------------------------------------------------------------

/// Meta row of one cluster.
pub async fn get_meta(conn: &Connection, cluster_id: &ClusterId) -> Result<Option<ClusterMeta>> {
    let mut rows = conn
        .query(
            "SELECT cluster_id, match_key_config_id, datestamp FROM cluster_meta
             WHERE cluster_id = ?1",
            params![cluster_id.to_string()],
        )
        .await
        .map_err(db_err)?;

    match rows.next().await.map_err(db_err)? {
        Some(row) => Ok(Some(row_to_meta(&row)?)),
        None => Ok(None),
    }
}

/// A cluster with its records and match values, or `None` if it never existed.
pub async fn get_cluster(conn: &Connection, cluster_id: &ClusterId) -> Result<Option<Cluster>> {
    let Some(meta) = get_meta(conn, cluster_id).await? else {
        return Ok(None);
    };
    let id = cluster_id.to_string();

    let mut rows = conn
        .query(
            "SELECT g.id, g.local_id, g.source_id, g.source_version, g.payload
             FROM cluster_records r JOIN global_records g ON g.id = r.record_id
             WHERE r.cluster_id = ?1",
            params![id.as_str()],
        )
        .await
        .map_err(db_err)?;
    let mut records = Vec::new();
    while let Some(row) = rows.next().await.map_err(db_err)? {
        records.push(row_to_global_record(&row)?);
    }

    let mut rows = conn
        .query(
            "SELECT match_value FROM cluster_values WHERE cluster_id = ?1",
            params![id.as_str()],
        )
        .await
        .map_err(db_err)?;
    let mut values = Vec::new();
    while let Some(row) = rows.next().await.map_err(db_err)? {
        values.push(row.get::<String>(0).map_err(db_err)?);
    }

    Ok(Some(Cluster::new(
        meta.cluster_id,
        Some(meta.datestamp),
        records,
        values,
    )))
}

/// Clusters of one config changed at or after `since`, by (datestamp, id).
///
/// With `after`, rows at exactly `since` are only returned past that id, so
/// `(last.datestamp, last.cluster_id)` continues a page.
pub async fn changed_since(
    conn: &Connection,
    match_key_config_id: &str,
    since: i64,
    after: Option<&ClusterId>,
    limit: u32,
) -> Result<Vec<ClusterMeta>> {
    let limit = i64::from(limit);
    let mut rows = match after {
        None => conn
            .query(
                "SELECT cluster_id, match_key_config_id, datestamp FROM cluster_meta
                 WHERE match_key_config_id = ?1 AND datestamp >= ?2
                 ORDER BY datestamp, cluster_id LIMIT ?3",
                params![match_key_config_id, since, limit],
            )
            .await
            .map_err(db_err)?,
        Some(after) => conn
            .query(
                "SELECT cluster_id, match_key_config_id, datestamp FROM cluster_meta
                 WHERE match_key_config_id = ?1
                   AND (datestamp > ?2 OR (datestamp = ?2 AND cluster_id > ?3))
                 ORDER BY datestamp, cluster_id LIMIT ?4",
                params![match_key_config_id, since, after.to_string(), limit],
            )
            .await
            .map_err(db_err)?,
    };

    let mut results = Vec::new();
    while let Some(row) = rows.next().await.map_err(db_err)? {
        results.push(row_to_meta(&row)?);
    }
    Ok(results)
}

/// Cluster a record belongs to under one config.
pub async fn cluster_of_record(
    conn: &Connection,
    record_id: &RecordId,
    match_key_config_id: &str,
) -> Result<Option<ClusterId>> {
    let mut rows = conn
        .query(
            "SELECT cluster_id FROM cluster_records
             WHERE record_id = ?1 AND match_key_config_id = ?2",
            params![record_id.to_string(), match_key_config_id],
        )
        .await
        .map_err(db_err)?;
    match rows.next().await.map_err(db_err)? {
        Some(row) => Ok(Some(parse_id(&row.get::<String>(0).map_err(db_err)?)?)),
        None => Ok(None),
    }
}

/// Cluster owning one match value under one config.
pub async fn cluster_of_value(
    conn: &Connection,
    match_key_config_id: &str,
    match_value: &str,
) -> Result<Option<ClusterId>> {
    let mut rows = conn
        .query(
            "SELECT cluster_id FROM cluster_values
             WHERE match_key_config_id = ?1 AND match_value = ?2",
            params![match_key_config_id, match_value],
        )
        .await
        .map_err(db_err)?;
    match rows.next().await.map_err(db_err)? {
        Some(row) => Ok(Some(parse_id(&row.get::<String>(0).map_err(db_err)?)?)),
        None => Ok(None),
    }
}

/// `(values, memberships, metas)` row counts of one config.
pub async fn row_counts(conn: &Connection, match_key_config_id: &str) -> Result<(u64, u64, u64)> {
    let mut counts = [0u64; 3];
    for (slot, table) in ["cluster_values", "cluster_records", "cluster_meta"]
        .into_iter()
        .enumerate()
    {
        let mut rows = conn
            .query(
                &format!("SELECT COUNT(*) FROM {table} WHERE match_key_config_id = ?1"),
                params![match_key_config_id],
            )
            .await
            .map_err(db_err)?;
        if let Some(row) = rows.next().await.map_err(db_err)? {
            counts[slot] = row.get::<i64>(0).map_err(db_err)? as u64;
        }
    }
    Ok((counts[0], counts[1], counts[2]))
}

/// Histogram statistics over the non-empty clusters of one config.
pub async fn stats(conn: &Connection, match_key_config_id: &str) -> Result<MatchKeyStats> {
    let mut rows = conn
        .query(
            "SELECT r.cluster_id, COUNT(*),
                    (SELECT COUNT(*) FROM cluster_values v
                     WHERE v.cluster_id = r.cluster_id
                       AND v.match_key_config_id = r.match_key_config_id)
             FROM cluster_records r
             WHERE r.match_key_config_id = ?1
             GROUP BY r.cluster_id
             ORDER BY r.cluster_id",
            params![match_key_config_id],
        )
        .await
        .map_err(db_err)?;

    let mut stats = MatchKeyStats::default();
    while let Some(row) = rows.next().await.map_err(db_err)? {
        let cluster: ClusterId = parse_id(&row.get::<String>(0).map_err(db_err)?)?;
        let records = row.get::<i64>(1).map_err(db_err)? as u64;
        let values = row.get::<i64>(2).map_err(db_err)? as u64;

        stats.clusters_total += 1;
        stats.records_total += records;
        *stats.match_values_per_cluster.entry(values).or_default() += 1;
        *stats.records_per_cluster.entry(records).or_default() += 1;
        let sample = stats.records_per_cluster_sample.entry(records).or_default();
        if sample.len() < STATS_SAMPLE {
            sample.push(cluster);
        }
    }
    Ok(stats)
}

fn row_to_meta(row: &libsql::Row) -> Result<ClusterMeta> {
    Ok(ClusterMeta {
        cluster_id: parse_id(&row.get::<String>(0).map_err(db_err)?)?,
        match_key_config_id: row.get::<String>(1).map_err(db_err)?,
        datestamp: row.get::<i64>(2).map_err(db_err)?,
    })
}
