//! Global record statements.
//!
//! All functions take a `&Connection`; pass a transaction to scope them.

use libsql::{Connection, Row, params};
use reservoir_shared::{GlobalRecord, RecordId, ReservoirError, Result, SourceId};
use serde_json::Value;

use crate::{db_err, parse_id};

const RECORD_COLUMNS: &str = "id, local_id, source_id, source_version, payload";

/// Insert or replace the payload of `(local_id, source_id, source_version)`.
///
/// Returns the record id and whether the row was newly created. An existing
/// row keeps its id.
pub async fn upsert_global_record(
    conn: &Connection,
    local_id: &str,
    source_id: &SourceId,
    source_version: i64,
    payload: &Value,
) -> Result<(RecordId, bool)> {
    let candidate = RecordId::new();
    let payload_json =
        serde_json::to_string(payload).map_err(|e| ReservoirError::Storage(e.to_string()))?;

    let mut rows = conn
        .query(
            "INSERT INTO global_records (id, local_id, source_id, source_version, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT (local_id, source_id, source_version)
             DO UPDATE SET payload = excluded.payload
             RETURNING id",
            params![
                candidate.to_string(),
                local_id,
                source_id.as_str(),
                source_version,
                payload_json
            ],
        )
        .await
        .map_err(db_err)?;

    let row = rows
        .next()
        .await
        .map_err(db_err)?
        .ok_or_else(|| ReservoirError::Storage("upsert returned no row".into()))?;
    let id: RecordId = parse_id(&row.get::<String>(0).map_err(db_err)?)?;
    Ok((id, id == candidate))
}

/// Delete `(local_id, source_id, source_version)`.
///
/// Every cluster the record belongs to gets its datestamp advanced first, so
/// harvesters see the shrink. Membership rows go with the record by cascade.
/// Returns `false` when no such record exists.
pub async fn delete_global_record(
    conn: &Connection,
    local_id: &str,
    source_id: &SourceId,
    source_version: i64,
    now: i64,
) -> Result<bool> {
    conn.execute(
        "UPDATE cluster_meta SET datestamp = MAX(datestamp + 1, ?4)
         WHERE cluster_id IN (
             SELECT r.cluster_id FROM cluster_records r
             JOIN global_records g ON g.id = r.record_id
             WHERE g.local_id = ?1 AND g.source_id = ?2 AND g.source_version = ?3
         )",
        params![local_id, source_id.as_str(), source_version, now],
    )
    .await
    .map_err(db_err)?;

    let deleted = conn
        .execute(
            "DELETE FROM global_records
             WHERE local_id = ?1 AND source_id = ?2 AND source_version = ?3",
            params![local_id, source_id.as_str(), source_version],
        )
        .await
        .map_err(db_err)?;
    Ok(deleted > 0)
}

/// Delete every record of one source (all versions). Returns the count.
pub async fn delete_source(conn: &Connection, source_id: &SourceId, now: i64) -> Result<u64> {
    conn.execute(
        "UPDATE cluster_meta SET datestamp = MAX(datestamp + 1, ?2)
         WHERE cluster_id IN (
             SELECT r.cluster_id FROM cluster_records r
             JOIN global_records g ON g.id = r.record_id
             WHERE g.source_id = ?1
         )",
        params![source_id.as_str(), now],
    )
    .await
    .map_err(db_err)?;

    conn.execute(
        "DELETE FROM global_records WHERE source_id = ?1",
        params![source_id.as_str()],
    )
    .await
    .map_err(db_err)
}

/// Get one record by id.
pub async fn get_global_record(conn: &Connection, id: &RecordId) -> Result<Option<GlobalRecord>> {
    let mut rows = conn
        .query(
            &format!("SELECT {RECORD_COLUMNS} FROM global_records WHERE id = ?1"),
            params![id.to_string()],
        )
        .await
        .map_err(db_err)?;

    match rows.next().await.map_err(db_err)? {
        Some(row) => Ok(Some(row_to_global_record(&row)?)),
        None => Ok(None),
    }
}

/// List records, optionally of one source, ordered by source and local id.
pub async fn list_global_records(
    conn: &Connection,
    source_id: Option<&SourceId>,
) -> Result<Vec<GlobalRecord>> {
    let mut rows = match source_id {
        Some(source) => conn
            .query(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM global_records WHERE source_id = ?1
                     ORDER BY source_id, source_version, local_id"
                ),
                params![source.as_str()],
            )
            .await
            .map_err(db_err)?,
        None => conn
            .query(
                &format!(
                    "SELECT {RECORD_COLUMNS} FROM global_records
                     ORDER BY source_id, source_version, local_id"
                ),
                params![],
            )
            .await
            .map_err(db_err)?,
    };

    let mut results = Vec::new();
    while let Some(row) = rows.next().await.map_err(db_err)? {
        results.push(row_to_global_record(&row)?);
    }
    Ok(results)
}

/// One keyset page of records ordered by id, starting after `after`.
pub async fn page_global_records(
    conn: &Connection,
    after: Option<&RecordId>,
    limit: u32,
) -> Result<Vec<GlobalRecord>> {
    let after = after.map(|id| id.to_string()).unwrap_or_default();
    let mut rows = conn
        .query(
            &format!(
                "SELECT {RECORD_COLUMNS} FROM global_records WHERE id > ?1 ORDER BY id LIMIT ?2"
            ),
            params![after, i64::from(limit)],
        )
        .await
        .map_err(db_err)?;

    let mut results = Vec::new();
    while let Some(row) = rows.next().await.map_err(db_err)? {
        results.push(row_to_global_record(&row)?);
    }
    Ok(results)
}

/// Convert a database row (in [`RECORD_COLUMNS`] order) to a [`GlobalRecord`].
pub(crate) fn row_to_global_record(row: &Row) -> Result<GlobalRecord> {
    let payload: String = row.get(4).map_err(db_err)?;
    Ok(GlobalRecord {
        id: parse_id(&row.get::<String>(0).map_err(db_err)?)?,
        local_id: row.get::<String>(1).map_err(db_err)?,
        source_id: row.get::<String>(2).map_err(db_err)?,
        source_version: row.get::<i64>(3).map_err(db_err)?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| ReservoirError::Storage(format!("invalid payload JSON: {e}")))?,
    })
}
