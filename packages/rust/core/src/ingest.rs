//! Bounded-concurrency ingest flow.
//!
//! [`IngestFlow`] feeds records one at a time into a [`RecordSink`], keeping
//! at most `window` per-record pipelines in flight. It emits
//! [`FlowSignal::Backpressure`] when the window fills,
//! [`FlowSignal::Resume`] once in-flight work drops to half the window, and
//! [`FlowSignal::Complete`] after the last pipeline finished.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use reservoir_shared::{IngestOutcome, IngestRecord, ReservoirError, Result};
use serde::Serialize;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, warn};

/// Failed records kept as samples in the summary.
pub const MAX_ERROR_SAMPLES: usize = 100;

/// Consumer of single ingest records.
pub trait RecordSink: Send + Sync + 'static {
    /// Store one record (and cluster it). Failures stay with this record.
    fn ingest(&self, record: IngestRecord) -> impl Future<Output = Result<IngestOutcome>> + Send;
}

/// Flow-control events for the producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSignal {
    Backpressure,
    Resume,
    Complete,
}

/// One failed record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_id: Option<String>,
    pub message: String,
}

/// Per-request ingest statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestSummary {
    pub processed: u64,
    pub ignored: u64,
    pub inserted: u64,
    pub updated: u64,
    pub deleted: u64,
    /// Up to [`MAX_ERROR_SAMPLES`] failures.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<RecordError>,
}

impl IngestSummary {
    fn count(&mut self, outcome: IngestOutcome) {
        self.processed += 1;
        match outcome {
            IngestOutcome::Inserted => self.inserted += 1,
            IngestOutcome::Updated => self.updated += 1,
            IngestOutcome::Deleted => self.deleted += 1,
            IngestOutcome::Ignored => self.ignored += 1,
        }
    }

    fn fail(&mut self, local_id: Option<String>, error: &ReservoirError) {
        self.processed += 1;
        self.ignored += 1;
        if self.errors.len() < MAX_ERROR_SAMPLES {
            self.errors.push(RecordError {
                local_id,
                message: error.to_string(),
            });
        }
    }
}

/// Shared between the flow and its in-flight tasks.
struct FlowState {
    window: usize,
    in_flight: AtomicUsize,
    paused: AtomicBool,
    summary: Mutex<IngestSummary>,
    signals: mpsc::UnboundedSender<FlowSignal>,
}

impl FlowState {
    fn signal(&self, signal: FlowSignal) {
        // A dropped receiver only means nobody listens.
        let _ = self.signals.send(signal);
    }

    fn started(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        if now >= self.window && !self.paused.swap(true, Ordering::SeqCst) {
            debug!(in_flight = now, "ingest window full");
            self.signal(FlowSignal::Backpressure);
        }
    }

    fn finished(&self) {
        let now = self.in_flight.fetch_sub(1, Ordering::SeqCst) - 1;
        if now <= self.window / 2 && self.paused.swap(false, Ordering::SeqCst) {
            debug!(in_flight = now, "ingest window drained");
            self.signal(FlowSignal::Resume);
        }
    }
}

/// One record in flight. Dropping it, even while unwinding from a panicking
/// sink, frees the slot.
struct InFlight {
    state: Arc<FlowState>,
    _permit: OwnedSemaphorePermit,
}

impl InFlight {
    fn start(state: Arc<FlowState>, permit: OwnedSemaphorePermit) -> Self {
        state.started();
        Self {
            state,
            _permit: permit,
        }
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        // Runs before the permit is released.
        self.state.finished();
    }
}

/// Bounded-concurrency driver for a [`RecordSink`].
pub struct IngestFlow<S> {
    sink: Arc<S>,
    state: Arc<FlowState>,
    permits: Arc<Semaphore>,
    tasks: JoinSet<()>,
}

impl<S: RecordSink> IngestFlow<S> {
    /// Create a flow with at most `window` records in flight (minimum 1).
    pub fn new(sink: Arc<S>, window: usize) -> (Self, mpsc::UnboundedReceiver<FlowSignal>) {
        let window = window.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let flow = Self {
            sink,
            state: Arc::new(FlowState {
                window,
                in_flight: AtomicUsize::new(0),
                paused: AtomicBool::new(false),
                summary: Mutex::new(IngestSummary::default()),
                signals: tx,
            }),
            permits: Arc::new(Semaphore::new(window)),
            tasks: JoinSet::new(),
        };
        (flow, rx)
    }

    /// Records currently being processed.
    pub fn in_flight(&self) -> usize {
        self.state.in_flight.load(Ordering::SeqCst)
    }

    /// Start processing `record`, waiting for a free slot first.
    pub async fn accept(&mut self, record: IngestRecord) -> Result<()> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ReservoirError::Storage("ingest window closed".into()))?;

        // Reap finished tasks so the set does not grow with the batch.
        while let Some(joined) = self.tasks.try_join_next() {
            self.reap(joined).await;
        }

        let slot = InFlight::start(self.state.clone(), permit);
        let sink = self.sink.clone();
        self.tasks.spawn(async move {
            let local_id = record.local_id.clone();
            let result = sink.ingest(record).await;
            {
                let mut summary = slot.state.summary.lock().await;
                match result {
                    Ok(outcome) => summary.count(outcome),
                    Err(e) => {
                        warn!(local_id = local_id.as_deref().unwrap_or(""), error = %e, "record failed");
                        summary.fail(local_id, &e);
                    }
                }
            }
            drop(slot);
        });
        Ok(())
    }

    /// Count a record rejected before it reached the sink.
    pub async fn reject(&self, local_id: Option<String>, error: &ReservoirError) {
        warn!(local_id = local_id.as_deref().unwrap_or(""), error = %error, "record rejected");
        self.state.summary.lock().await.fail(local_id, error);
    }

    /// Wait for all in-flight work and return the statistics.
    pub async fn finish(mut self) -> IngestSummary {
        while let Some(joined) = self.tasks.join_next().await {
            self.reap(joined).await;
        }
        self.state.signal(FlowSignal::Complete);
        std::mem::take(&mut *self.state.summary.lock().await)
    }

    /// Count a task that died before reporting its record.
    async fn reap(&self, joined: std::result::Result<(), JoinError>) {
        if let Err(e) = joined {
            error!(error = %e, "ingest task aborted");
            let failure = ReservoirError::Storage(format!("ingest task aborted: {e}"));
            self.state.summary.lock().await.fail(None, &failure);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Sink that holds each record until released and tracks peak concurrency.
    struct FakeSink {
        current: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    impl FakeSink {
        fn new(delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                current: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay: Duration::from_millis(delay_ms),
            })
        }
    }

    impl RecordSink for FakeSink {
        async fn ingest(&self, record: IngestRecord) -> Result<IngestOutcome> {
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.current.fetch_sub(1, Ordering::SeqCst);

            match record.local_id.as_deref() {
                Some("panic") => panic!("sink gave up"),
                Some("bad") => Err(ReservoirError::Storage("boom".into())),
                Some(id) if id.starts_with("new") => Ok(IngestOutcome::Inserted),
                Some(_) if record.delete => Ok(IngestOutcome::Deleted),
                Some(_) => Ok(IngestOutcome::Updated),
                None => Err(ReservoirError::validation("localId required")),
            }
        }
    }

    #[tokio::test]
    async fn window_caps_concurrency() {
        let sink = FakeSink::new(20);
        let (mut flow, _signals) = IngestFlow::new(sink.clone(), 3);
        for i in 0..12 {
            flow.accept(IngestRecord::upsert(format!("new{i}"), serde_json::json!({})))
                .await
                .unwrap();
            assert!(flow.in_flight() <= 3);
        }
        let summary = flow.finish().await;
        assert_eq!(summary.inserted, 12);
        assert!(sink.peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn signals_backpressure_resume_complete() {
        let sink = FakeSink::new(10);
        let (mut flow, mut signals) = IngestFlow::new(sink, 2);
        for i in 0..6 {
            flow.accept(IngestRecord::upsert(format!("new{i}"), serde_json::json!({})))
                .await
                .unwrap();
        }
        flow.finish().await;

        let mut seen = Vec::new();
        while let Ok(signal) = signals.try_recv() {
            seen.push(signal);
        }
        assert_eq!(seen.first(), Some(&FlowSignal::Backpressure));
        assert_eq!(seen.last(), Some(&FlowSignal::Complete));
        assert!(seen.contains(&FlowSignal::Resume));
        assert_eq!(seen.iter().filter(|s| **s == FlowSignal::Complete).count(), 1);
    }

    #[tokio::test]
    async fn failures_are_counted_not_fatal() {
        let sink = FakeSink::new(1);
        let (mut flow, _signals) = IngestFlow::new(sink, 5);
        let records = vec![
            IngestRecord::upsert("new1", serde_json::json!({})),
            IngestRecord::upsert("bad", serde_json::json!({})),
            IngestRecord::upsert("old", serde_json::json!({})),
            IngestRecord::delete("old"),
            IngestRecord {
                local_id: None,
                payload: Some(serde_json::json!({})),
                delete: false,
            },
        ];
        for r in records {
            flow.accept(r).await.unwrap();
        }
        flow.reject(Some("shape".into()), &ReservoirError::validation("malformed"))
            .await;

        let summary = flow.finish().await;
        assert_eq!(summary.processed, 6);
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.updated, 1);
        assert_eq!(summary.deleted, 1);
        assert_eq!(summary.ignored, 3);
        assert_eq!(summary.errors.len(), 3);
        assert!(summary.errors.iter().any(|e| e.local_id.as_deref() == Some("bad")));
    }

    #[tokio::test]
    async fn panicking_sink_frees_its_slot() {
        let sink = FakeSink::new(5);
        let (mut flow, mut signals) = IngestFlow::new(sink, 2);
        for id in ["panic", "panic", "new1"] {
            flow.accept(IngestRecord::upsert(id, serde_json::json!({})))
                .await
                .unwrap();
        }
        let summary = flow.finish().await;

        let mut seen = Vec::new();
        while let Ok(signal) = signals.try_recv() {
            seen.push(signal);
        }
        assert!(seen.contains(&FlowSignal::Resume));
        assert_eq!(seen.last(), Some(&FlowSignal::Complete));
        assert_eq!(summary.processed, 3);
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.ignored, 2);
        assert!(summary.errors.iter().all(|e| e.local_id.is_none()));
        assert!(summary.errors[0].message.contains("aborted"));
    }

    #[tokio::test]
    async fn error_samples_are_capped() {
        let sink = FakeSink::new(0);
        let (mut flow, _signals) = IngestFlow::new(sink, 8);
        for _ in 0..(MAX_ERROR_SAMPLES + 20) {
            flow.accept(IngestRecord::upsert("bad", serde_json::json!({})))
                .await
                .unwrap();
        }
        let summary = flow.finish().await;
        assert_eq!(summary.ignored as usize, MAX_ERROR_SAMPLES + 20);
        assert_eq!(summary.errors.len(), MAX_ERROR_SAMPLES);
    }

    #[tokio::test]
    async fn empty_flow_completes() {
        let (flow, mut signals) = IngestFlow::new(FakeSink::new(0), 5);
        let summary = flow.finish().await;
        assert_eq!(summary, IngestSummary::default());
        assert_eq!(signals.try_recv().ok(), Some(FlowSignal::Complete));
    }
}
