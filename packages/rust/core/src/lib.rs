//! Clustering and ingest orchestration for Reservoir.
//!
//! This crate ties the record store, match key methods and the clustering
//! engine together:
//! - [`cluster`]: assigning a record to a cluster (find, create, merge)
//! - [`ingest`]: the bounded-concurrency flow controller
//! - [`pipeline`]: per-record store + cluster, batch ingest
//! - [`reindex`]: recomputing one match key over all records
//! - [`retry`]: the retry-on-conflict combinator

pub mod cluster;
pub mod ingest;
pub mod pipeline;
pub mod reindex;
pub mod retry;

pub use cluster::{ClusterAssignment, assign_cluster, truncate_match_values};
pub use ingest::{FlowSignal, IngestFlow, IngestSummary, RecordError, RecordSink};
pub use pipeline::{
    IngestRequest, ProgressReporter, RecordIngester, SilentProgress, ingest_records,
};
pub use reindex::{ReindexStats, initialize_match_key};
pub use retry::with_retry;

/// Temp-file storage with an `isbn` match key, shared by the tests of this crate.
#[cfg(test)]
pub(crate) mod test_support {
    use reservoir_shared::MatchKeyConfig;
    use reservoir_storage::Storage;
    use uuid::Uuid;

    pub(crate) async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("reservoir_core_test_{}.db", Uuid::now_v7()));
        let storage = Storage::open(&tmp, "test".parse().unwrap())
            .await
            .expect("open test db");
        storage
            .insert_match_key_config(&MatchKeyConfig {
                id: "isbn".into(),
                method: "jsonpath".into(),
                params: serde_json::json!({ "expr": "$.identifiers[*].isbn" }),
                update: "ingest".into(),
            })
            .await
            .expect("insert isbn config");
        storage
    }
}
