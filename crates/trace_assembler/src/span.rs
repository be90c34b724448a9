//! Span Record data model.
//!
//! A [`SpanRecord`] is a finished unit of timed work. Records are produced by
//! the instrumentation layer, admitted through [`crate::intake::SpanIntake`],
//! and from then on treated as immutable by the pipeline: the tree builder and
//! assembler only ever read them.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Span identifier, unique within a trace. Zero means "unset".
pub type SpanId = u64;

/// Trace identifier. Zero means "unset".
pub type TraceId = u128;

/// Returns the current wall-clock time as Unix nanoseconds.
pub fn now_unix_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

/// Attribute value attached to spans and span events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeValue {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// The role a span played in the operation it measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanKind {
    Internal,
    Server,
    Client,
    Producer,
    Consumer,
}

/// Outcome of the operation a span measures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanStatus {
    /// No status was recorded.
    Unset,
    /// The operation completed successfully.
    Ok,
    /// The operation failed. The description, when set, becomes the emitted
    /// status string; otherwise the `http.status_code` attribute refines a
    /// generic failure.
    Error { description: Option<String> },
}

/// A timed sub-event recorded while the span was open (exceptions,
/// measurements, log points).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanEvent {
    pub name: String,
    pub unix_nanos: u64,
    pub attributes: HashMap<String, AttributeValue>,
}

impl SpanEvent {
    pub fn new(name: impl Into<String>, unix_nanos: u64) -> Self {
        Self {
            name: name.into(),
            unix_nanos,
            attributes: HashMap::new(),
        }
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: AttributeValue) {
        self.attributes.insert(key.into(), value);
    }
}

/// A finished unit of timed work.
///
/// `end_unix_nanos == 0` means "no end time recorded" (the upstream SDK's
/// `[0, 0]` sentinel); such records are rejected by required-field validation
/// during assembly rather than at admission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanRecord {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    /// Direct parent within the same process, if any.
    pub parent_span_id: Option<SpanId>,
    /// Set when the logical parent lives upstream (another process). The span
    /// then counts as a trace root for assembly purposes.
    pub parent_is_remote: bool,
    pub name: String,
    pub kind: SpanKind,
    pub status: SpanStatus,
    pub start_unix_nanos: u64,
    pub end_unix_nanos: u64,
    pub attributes: HashMap<String, AttributeValue>,
    pub events: Vec<SpanEvent>,
    /// Resource metadata of the producing entity (service name, instance id).
    pub resource: HashMap<String, AttributeValue>,
    /// Sampling decision made at span creation. Read-only here: the intake
    /// filter honors it, nothing in this pipeline revises it.
    pub sampled: bool,
    /// Sample rate attached alongside the decision, if known.
    pub sample_rate: Option<f64>,
}

impl SpanRecord {
    /// Creates a new record with the start time set to now and no end time.
    pub fn new(
        trace_id: TraceId,
        span_id: SpanId,
        parent_span_id: Option<SpanId>,
        name: impl Into<String>,
        kind: SpanKind,
    ) -> Self {
        Self {
            trace_id,
            span_id,
            parent_span_id,
            parent_is_remote: false,
            name: name.into(),
            kind,
            status: SpanStatus::Unset,
            start_unix_nanos: now_unix_nanos(),
            end_unix_nanos: 0,
            attributes: HashMap::new(),
            events: Vec::new(),
            resource: HashMap::new(),
            sampled: true,
            sample_rate: None,
        }
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: AttributeValue) {
        self.attributes.insert(key.into(), value);
    }

    pub fn add_event(&mut self, event: SpanEvent) {
        self.events.push(event);
    }

    /// Marks the span finished with the given status and an end time of now.
    pub fn finish(&mut self, status: SpanStatus) {
        self.status = status;
        self.end_unix_nanos = now_unix_nanos();
    }

    /// Parent id as seen by the tree builder: `None` when there is no parent
    /// at all, and also `None` when the parent is remote, in which case the
    /// span is a local trace root even though a logical parent exists
    /// upstream.
    pub fn effective_parent_id(&self) -> Option<SpanId> {
        if self.parent_is_remote {
            None
        } else {
            self.parent_span_id
        }
    }

    /// Whether the record carries everything the protocol requires of an
    /// output span: nonzero ids and both timestamps.
    pub fn has_required_fields(&self) -> bool {
        self.span_id != 0
            && self.trace_id != 0
            && self.start_unix_nanos != 0
            && self.end_unix_nanos != 0
    }

    pub fn duration_nanos(&self) -> u64 {
        self.end_unix_nanos.saturating_sub(self.start_unix_nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_parent_none_for_remote_parent() {
        let mut record = SpanRecord::new(1, 2, Some(99), "http.request", SpanKind::Server);
        assert_eq!(record.effective_parent_id(), Some(99));

        record.parent_is_remote = true;
        assert_eq!(record.effective_parent_id(), None);
        // The raw parent link is preserved for the emitted trace context.
        assert_eq!(record.parent_span_id, Some(99));
    }

    #[test]
    fn required_fields_need_both_timestamps() {
        let mut record = SpanRecord::new(1, 2, None, "db.query", SpanKind::Client);
        assert!(!record.has_required_fields()); // no end time yet

        record.finish(SpanStatus::Ok);
        assert!(record.has_required_fields());

        record.span_id = 0;
        assert!(!record.has_required_fields());
    }

    #[test]
    fn finish_sets_status_and_end_time() {
        let mut record = SpanRecord::new(1, 2, None, "cache.get", SpanKind::Internal);
        assert_eq!(record.end_unix_nanos, 0);

        record.finish(SpanStatus::Error {
            description: Some("timed out".to_string()),
        });
        assert_eq!(
            record.status,
            SpanStatus::Error {
                description: Some("timed out".to_string())
            }
        );
        assert!(record.end_unix_nanos >= record.start_unix_nanos);
    }

    #[test]
    fn serde_round_trip_preserves_attributes() {
        let mut record = SpanRecord::new(7, 8, Some(3), "queue.publish", SpanKind::Producer);
        record.set_attribute("messaging.system", AttributeValue::String("kafka".into()));
        record.set_attribute("retries", AttributeValue::Int(2));
        record.finish(SpanStatus::Ok);

        let json = serde_json::to_string(&record).unwrap();
        let back: SpanRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }
}
