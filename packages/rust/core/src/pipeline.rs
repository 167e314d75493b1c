//! End-to-end ingest: JSON batch → validate → store → cluster, per record.

use std::sync::Arc;
use std::time::Instant;

use reservoir_matchkey::{JsonPathMethod, MatchKeyMethod, MethodCache};
use reservoir_shared::{
    IngestConfig, IngestOutcome, IngestRecord, MatchKeyConfig, ReservoirError, Result, SourceId,
    datestamp_now,
};
use reservoir_storage::records;
use reservoir_storage::{Connection, Storage};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::cluster::{assign_cluster, truncate_match_values};
use crate::ingest::{FlowSignal, IngestFlow, IngestSummary, RecordSink};
use crate::retry::with_retry;

/// Batch-level parameters of one ingest request.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub source_id: SourceId,
    /// Defaults to 1.
    pub source_version: i64,
    /// JSONPath deriving `localId` from the payload when a record has none.
    pub local_id_path: Option<String>,
}

impl IngestRequest {
    pub fn new(source_id: SourceId) -> Self {
        Self {
            source_id,
            source_version: 1,
            local_id_path: None,
        }
    }
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called after each record was handed on.
    fn record_done(&self, count: u64);
    /// Called on ingest flow-control changes.
    fn flow(&self, signal: FlowSignal);
    /// Called when an ingest completes.
    fn done(&self, summary: &IngestSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn record_done(&self, _count: u64) {}
    fn flow(&self, _signal: FlowSignal) {}
    fn done(&self, _summary: &IngestSummary) {}
}

/// The production [`RecordSink`]: stores a record and clusters it under
/// every automatic match key config, in one transaction per attempt.
pub struct RecordIngester {
    storage: Arc<Storage>,
    source_id: SourceId,
    source_version: i64,
    local_id_path: Option<JsonPathMethod>,
    /// Loaded once per request.
    methods: Vec<(MatchKeyConfig, Arc<dyn MatchKeyMethod>)>,
    max_len: usize,
    retries: usize,
}

impl RecordIngester {
    /// Resolve the request's match key configs and methods.
    pub async fn new(
        storage: Arc<Storage>,
        cache: &MethodCache,
        request: IngestRequest,
        config: &IngestConfig,
    ) -> Result<Self> {
        let local_id_path = request
            .local_id_path
            .as_deref()
            .map(JsonPathMethod::new)
            .transpose()?;

        let mut methods = Vec::new();
        for mk in storage.list_match_key_configs().await? {
            if !mk.is_automatic() {
                debug!(match_key = %mk.id, "skipping manual match key");
                continue;
            }
            let method = cache.get(storage.tenant(), &mk)?;
            methods.push((mk, method));
        }

        Ok(Self {
            storage,
            source_id: request.source_id,
            source_version: request.source_version,
            local_id_path,
            methods,
            max_len: config.match_value_max_length,
            retries: config.retries,
        })
    }

    /// Ids of the match key configs computed on ingest.
    pub fn match_keys(&self) -> Vec<&str> {
        self.methods.iter().map(|(mk, _)| mk.id.as_str()).collect()
    }

    /// The record's local id: given, or derived from the payload.
    fn local_id(&self, record: &IngestRecord) -> Result<String> {
        if let Some(id) = &record.local_id {
            return Ok(id.clone());
        }
        self.local_id_path
            .as_ref()
            .zip(record.payload.as_ref())
            .and_then(|(path, payload)| path.first_string(payload))
            .map(|id| id.trim().to_string())
            .ok_or_else(|| ReservoirError::validation("localId required"))
    }

    /// One attempt: a fresh transaction holding the record op and clustering.
    async fn apply(&self, record: &IngestRecord, local_id: &str) -> Result<IngestOutcome> {
        let tx = self.storage.begin_write().await?;
        let result = self.apply_in(&tx, record, local_id).await;
        match result {
            Ok(outcome) => {
                reservoir_storage::commit(tx).await?;
                Ok(outcome)
            }
            Err(e) => {
                reservoir_storage::rollback(tx).await;
                Err(e)
            }
        }
    }

    async fn apply_in(
        &self,
        conn: &Connection,
        record: &IngestRecord,
        local_id: &str,
    ) -> Result<IngestOutcome> {
        if record.delete {
            let found = records::delete_global_record(
                conn,
                local_id,
                &self.source_id,
                self.source_version,
                datestamp_now(),
            )
            .await?;
            return Ok(if found {
                IngestOutcome::Deleted
            } else {
                IngestOutcome::Ignored
            });
        }

        let payload = record
            .payload
            .as_ref()
            .ok_or_else(|| ReservoirError::validation("payload required"))?;
        let (record_id, created) = records::upsert_global_record(
            conn,
            local_id,
            &self.source_id,
            self.source_version,
            payload,
        )
        .await?;

        for (mk, method) in &self.methods {
            let values = truncate_match_values(method.match_values(payload)?, self.max_len);
            assign_cluster(conn, &record_id, &mk.id, &values).await?;
        }

        Ok(if created {
            IngestOutcome::Inserted
        } else {
            IngestOutcome::Updated
        })
    }
}

impl RecordSink for RecordIngester {
    async fn ingest(&self, record: IngestRecord) -> Result<IngestOutcome> {
        let local_id = self.local_id(&record)?;
        if !record.delete && record.payload.is_none() {
            return Err(ReservoirError::validation("payload required"));
        }
        with_retry(self.retries, |_| self.apply(&record, &local_id)).await
    }
}

/// Ingest a batch of concatenated JSON values (JSON lines included).
///
/// Input that is not JSON aborts the request after in-flight records
/// finished. A JSON value that is not a record is counted as ignored.
#[instrument(skip_all, fields(tenant = %storage.tenant(), source_id = %request.source_id, source_version = request.source_version))]
pub async fn ingest_records(
    storage: Arc<Storage>,
    cache: &MethodCache,
    config: &IngestConfig,
    request: IngestRequest,
    input: &[u8],
    progress: &dyn ProgressReporter,
) -> Result<IngestSummary> {
    let start = Instant::now();
    progress.phase("Loading match keys");
    let sink = Arc::new(RecordIngester::new(storage, cache, request, config).await?);
    info!(match_keys = ?sink.match_keys(), window = config.window, "starting ingest");

    progress.phase("Ingesting records");
    let (mut flow, mut signals) = IngestFlow::new(sink, config.window);
    let mut count = 0u64;
    let mut framing_error = None;

    for item in serde_json::Deserializer::from_slice(input).into_iter::<Value>() {
        let value = match item {
            Ok(value) => value,
            Err(e) => {
                warn!(in_flight = flow.in_flight(), error = %e, "invalid JSON, draining in-flight records");
                framing_error = Some(ReservoirError::parse(format!(
                    "invalid JSON after {count} records: {e}"
                )));
                break;
            }
        };
        count += 1;

        let local_id = value
            .get("localId")
            .and_then(Value::as_str)
            .map(String::from);
        match IngestRecord::from_value(value) {
            Ok(record) => flow.accept(record).await?,
            Err(e) => flow.reject(local_id, &e).await,
        }

        while let Ok(signal) = signals.try_recv() {
            progress.flow(signal);
        }
        progress.record_done(count);
    }

    let summary = flow.finish().await;
    while let Ok(signal) = signals.try_recv() {
        progress.flow(signal);
    }
    if let Some(e) = framing_error {
        return Err(e);
    }

    info!(
        processed = summary.processed,
        inserted = summary.inserted,
        updated = summary.updated,
        deleted = summary.deleted,
        ignored = summary.ignored,
        duration_ms = start.elapsed().as_millis(),
        "ingest completed"
    );
    progress.done(&summary);
    Ok(summary)
}
