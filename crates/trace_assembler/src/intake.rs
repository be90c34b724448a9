//! Span Intake.
//!
//! Receives spans as they finish from the instrumentation layer. On span
//! start, creation-time context (owning scope snapshot, active parent span)
//! is recorded in an explicit side table keyed by span id, so nothing
//! downstream ever has to recompute it. On span end, span-level side effects
//! run and the record is forwarded to the exporter — but only when the
//! sampling decision attached at creation time says to record it. This
//! component reads that decision; it never makes or revises it.
//!
//! Lifecycle per span: `Started -> Ended` (one-way; ending twice is a no-op).
//! The side table holds started spans only; ending a span removes its entry,
//! so the table is bounded by the number of spans currently open. The
//! terminal states (included in a transaction, or evicted as stale) are
//! owned by the flush processor.

use crate::exporter::{ExportError, TraceExporter};
use crate::span::{SpanId, SpanRecord};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// How many recently ended span ids are remembered for double-end
/// detection. Old ids age out in arrival order once the cap is reached.
const RECENTLY_ENDED_CAPACITY: usize = 4096;

/// Snapshot of the scope/hub owning a span at creation time. Opaque to the
/// pipeline: stored on start, readable until the span ends.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeHandle {
    pub scope_id: u64,
    pub tags: HashMap<String, String>,
}

#[derive(Debug)]
struct IntakeEntry {
    scope: ScopeHandle,
    parent_span_id: Option<SpanId>,
}

/// Creation-time context for a started span, as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpanContext {
    pub scope: ScopeHandle,
    pub parent_span_id: Option<SpanId>,
}

/// Admission point between the instrumentation layer and the exporter.
pub struct SpanIntake {
    /// Creation-time context for spans that have started but not yet ended.
    entries: HashMap<SpanId, IntakeEntry>,
    /// Capped set of span ids that already ended, newest at the back.
    recently_ended: HashSet<SpanId>,
    ended_order: VecDeque<SpanId>,
    exporter: Arc<TraceExporter>,
}

impl SpanIntake {
    pub fn new(exporter: Arc<TraceExporter>) -> Self {
        Self {
            entries: HashMap::new(),
            recently_ended: HashSet::new(),
            ended_order: VecDeque::new(),
            exporter,
        }
    }

    /// Snapshots the owning scope and the currently active parent span for a
    /// span that just started.
    pub fn on_span_start(
        &mut self,
        span_id: SpanId,
        scope: ScopeHandle,
        parent_span_id: Option<SpanId>,
    ) {
        self.entries.insert(
            span_id,
            IntakeEntry {
                scope,
                parent_span_id,
            },
        );
    }

    /// Creation-time context for a span that has started but not ended.
    pub fn context_for(&self, span_id: SpanId) -> Option<SpanContext> {
        self.entries.get(&span_id).map(|entry| SpanContext {
            scope: entry.scope.clone(),
            parent_span_id: entry.parent_span_id,
        })
    }

    /// Handles a finished span: runs span-end side effects and forwards the
    /// record to the exporter if the creation-time sampling decision says to
    /// record it.
    ///
    /// Ending a span twice is a no-op and returns `Ok`.
    pub async fn on_span_end(&mut self, record: SpanRecord) -> Result<(), ExportError> {
        let span_id = record.span_id;

        if self.recently_ended.contains(&span_id) {
            return Ok(());
        }

        // The side table is done with this span either way: forwarded or
        // dropped, the entry goes. Ends for spans never started through
        // this intake (foreign instrumentation) are admitted too.
        self.entries.remove(&span_id);
        self.mark_ended(span_id);

        if !record.sampled {
            debug!(span_id, name = %record.name, "dropping unsampled span");
            return Ok(());
        }

        let record = apply_end_effects(record);
        self.exporter.export(vec![record]).await
    }

    /// Number of spans currently open (started but not ended).
    pub fn tracked_count(&self) -> usize {
        self.entries.len()
    }

    fn mark_ended(&mut self, span_id: SpanId) {
        if !self.recently_ended.insert(span_id) {
            return;
        }
        self.ended_order.push_back(span_id);
        if self.ended_order.len() > RECENTLY_ENDED_CAPACITY {
            if let Some(oldest) = self.ended_order.pop_front() {
                self.recently_ended.remove(&oldest);
            }
        }
    }
}

/// Span-end side effects. Currently: surface an `exception` sub-event as
/// error attributes so the backend can index the failure without walking
/// events.
fn apply_end_effects(mut record: SpanRecord) -> SpanRecord {
    let exception = record
        .events
        .iter()
        .find(|event| event.name == "exception")
        .cloned();

    if let Some(exception) = exception {
        if let Some(message) = exception.attributes.get("exception.message") {
            record
                .attributes
                .entry("error.message".to_string())
                .or_insert_with(|| message.clone());
        }
        if let Some(kind) = exception.attributes.get("exception.type") {
            record
                .attributes
                .entry("error.type".to_string())
                .or_insert_with(|| kind.clone());
        }
    }

    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::ExporterConfig;
    use crate::span::{AttributeValue, SpanEvent, SpanKind, SpanStatus};
    use crate::transport::RecordingTransport;
    use std::time::Duration;

    fn test_exporter() -> (Arc<TraceExporter>, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::new());
        let exporter = Arc::new(TraceExporter::new(
            ExporterConfig::default().with_flush_interval(Duration::from_millis(20)),
            transport.clone(),
        ));
        (exporter, transport)
    }

    fn finished(span_id: u64, parent: Option<u64>) -> SpanRecord {
        let mut record = SpanRecord::new(1, span_id, parent, "op", SpanKind::Internal);
        record.finish(SpanStatus::Ok);
        record
    }

    #[tokio::test]
    async fn snapshots_creation_time_context() {
        let (exporter, _transport) = test_exporter();
        let mut intake = SpanIntake::new(exporter.clone());

        let scope = ScopeHandle {
            scope_id: 42,
            tags: HashMap::from([("env".to_string(), "test".to_string())]),
        };
        intake.on_span_start(7, scope.clone(), Some(3));

        let context = intake.context_for(7).unwrap();
        assert_eq!(context.scope, scope);
        assert_eq!(context.parent_span_id, Some(3));

        exporter.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn ending_twice_is_a_no_op() {
        let (exporter, transport) = test_exporter();
        let mut intake = SpanIntake::new(exporter.clone());

        intake.on_span_start(1, ScopeHandle::default(), None);
        intake.on_span_end(finished(1, None)).await.unwrap();
        intake.on_span_end(finished(1, None)).await.unwrap();

        exporter.force_flush().await.unwrap();
        exporter.shutdown().await.unwrap();

        // Forwarded once; the duplicate end never reached the exporter.
        assert_eq!(transport.transaction_count(), 1);
    }

    #[tokio::test]
    async fn side_table_entry_removed_once_span_ends() {
        let (exporter, _transport) = test_exporter();
        let mut intake = SpanIntake::new(exporter.clone());

        // Forwarded and dropped spans alike release their entries; the
        // table only holds spans that are still open.
        for span_id in 1..=100 {
            intake.on_span_start(span_id, ScopeHandle::default(), None);
        }
        assert_eq!(intake.tracked_count(), 100);

        for span_id in 1..=100 {
            let mut record = finished(span_id, None);
            record.sampled = span_id % 2 == 0;
            intake.on_span_end(record).await.unwrap();
        }

        assert_eq!(intake.tracked_count(), 0);
        assert!(intake.context_for(1).is_none());

        exporter.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unsampled_spans_are_dropped() {
        let (exporter, transport) = test_exporter();
        let mut intake = SpanIntake::new(exporter.clone());

        let mut record = finished(1, None);
        record.sampled = false;
        intake.on_span_start(1, ScopeHandle::default(), None);
        intake.on_span_end(record).await.unwrap();

        exporter.force_flush().await.unwrap();
        exporter.shutdown().await.unwrap();
        assert_eq!(transport.transaction_count(), 0);
    }

    #[tokio::test]
    async fn exception_event_becomes_error_attributes() {
        let (exporter, transport) = test_exporter();
        let mut intake = SpanIntake::new(exporter.clone());

        let mut record = finished(1, None);
        record.status = SpanStatus::Error { description: None };
        let mut event = SpanEvent::new("exception", record.end_unix_nanos);
        event.set_attribute(
            "exception.message",
            AttributeValue::String("connection refused".to_string()),
        );
        event.set_attribute(
            "exception.type",
            AttributeValue::String("IoError".to_string()),
        );
        record.add_event(event);

        intake.on_span_end(record).await.unwrap();
        exporter.force_flush().await.unwrap();
        exporter.shutdown().await.unwrap();

        let transactions = transport.all_transactions();
        assert_eq!(transactions.len(), 1);
        assert_eq!(
            transactions[0].attributes.get("error.message"),
            Some(&AttributeValue::String("connection refused".to_string()))
        );
        assert_eq!(
            transactions[0].attributes.get("error.type"),
            Some(&AttributeValue::String("IoError".to_string()))
        );
    }

    #[tokio::test]
    async fn unknown_span_end_is_admitted() {
        let (exporter, transport) = test_exporter();
        let mut intake = SpanIntake::new(exporter.clone());

        // No on_span_start; still forwarded.
        intake.on_span_end(finished(5, None)).await.unwrap();
        exporter.force_flush().await.unwrap();
        exporter.shutdown().await.unwrap();
        assert_eq!(transport.transaction_count(), 1);
    }
}
