//! Transaction Assembler.
//!
//! Converts a completed root node into one aggregate [`TransactionEvent`]:
//! the root's descriptive fields plus every descendant span reachable from it
//! at flush time. Placeholder nodes (spans that never arrived) contribute no
//! output span; their children are spliced one level up and re-parented to
//! the nearest materialized ancestor, preserving the shape of the tree minus
//! the missing node.

use crate::span::{AttributeValue, SpanId, SpanKind, SpanRecord, SpanStatus, TraceId};
use crate::tree::SpanTree;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Upper bound on descendant spans per transaction. When exceeded, the
/// earliest-starting spans are kept.
pub const MAX_SPANS_PER_TRANSACTION: usize = 1000;

/// One descendant span inside an emitted transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssembledSpan {
    pub span_id: SpanId,
    pub trace_id: TraceId,
    /// Nearest materialized ancestor in the output tree. May differ from the
    /// original parent when an interior span never arrived.
    pub parent_span_id: SpanId,
    pub name: String,
    pub kind: SpanKind,
    pub status: Option<String>,
    pub start_unix_nanos: u64,
    pub end_unix_nanos: u64,
    pub attributes: HashMap<String, AttributeValue>,
}

/// The aggregate event emitted once per completed trace root. Derived and
/// transient: produced, handed to the transport, then discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionEvent {
    pub name: String,
    pub trace_id: TraceId,
    pub span_id: SpanId,
    /// The root's original parent link, preserved for remote parents so the
    /// backend can stitch distributed traces back together.
    pub parent_span_id: Option<SpanId>,
    pub status: Option<String>,
    pub start_unix_nanos: u64,
    /// The root span's own end timestamp.
    pub end_unix_nanos: u64,
    pub attributes: HashMap<String, AttributeValue>,
    pub resource: HashMap<String, AttributeValue>,
    /// Numeric measurements extracted from the root's sub-events.
    pub measurements: HashMap<String, f64>,
    pub spans: Vec<AssembledSpan>,
}

/// Assembles the subtree under `root_id` into a transaction.
///
/// Returns the event plus every node id visited during assembly (root,
/// descendants, and placeholders), which the flush processor removes from the
/// pending buffer. Returns `None` when `root_id` does not name a completed
/// root in the tree.
pub fn assemble(root_id: SpanId, tree: &SpanTree) -> Option<(TransactionEvent, Vec<SpanId>)> {
    let root_node = tree.node(root_id)?;
    let root = root_node.record.as_ref()?;

    let mut visited = vec![root_id];
    let mut spans = Vec::new();

    for &child in &root_node.children {
        collect_descendants(child, root_id, tree, &mut spans, &mut visited);
    }

    if spans.len() > MAX_SPANS_PER_TRANSACTION {
        spans.sort_by_key(|s| s.start_unix_nanos);
        spans.truncate(MAX_SPANS_PER_TRANSACTION);
    }

    let event = TransactionEvent {
        name: root.name.clone(),
        trace_id: root.trace_id,
        span_id: root.span_id,
        parent_span_id: root.parent_span_id,
        status: status_message(root),
        start_unix_nanos: root.start_unix_nanos,
        end_unix_nanos: root.end_unix_nanos,
        attributes: root.attributes.clone(),
        resource: root.resource.clone(),
        measurements: measurements_from_events(root),
        spans,
    };

    Some((event, visited))
}

/// Depth-first walk of one child subtree.
///
/// `parent_in_output` is the nearest ancestor that made it into the output
/// tree. A node without a record, or whose record fails required-field
/// validation, produces no output span; its children attach to
/// `parent_in_output` instead.
fn collect_descendants(
    node_id: SpanId,
    parent_in_output: SpanId,
    tree: &SpanTree,
    spans: &mut Vec<AssembledSpan>,
    visited: &mut Vec<SpanId>,
) {
    visited.push(node_id);

    let Some(node) = tree.node(node_id) else {
        return;
    };

    let next_parent = match &node.record {
        Some(record) if record.has_required_fields() => {
            spans.push(convert_span(record, parent_in_output));
            record.span_id
        }
        // Missing or malformed span: splice its children one level up.
        _ => parent_in_output,
    };

    for &child in &node.children {
        collect_descendants(child, next_parent, tree, spans, visited);
    }
}

fn convert_span(record: &SpanRecord, parent_in_output: SpanId) -> AssembledSpan {
    AssembledSpan {
        span_id: record.span_id,
        trace_id: record.trace_id,
        parent_span_id: parent_in_output,
        name: record.name.clone(),
        kind: record.kind,
        status: status_message(record),
        start_unix_nanos: record.start_unix_nanos,
        end_unix_nanos: record.end_unix_nanos,
        attributes: record.attributes.clone(),
    }
}

/// Maps a record's status to the protocol status string. Per protocol, an
/// unset status is allowed to stay absent. An error status with a
/// description emits the description; only a bare error falls back to the
/// HTTP-code mapping.
pub fn status_message(record: &SpanRecord) -> Option<String> {
    match &record.status {
        SpanStatus::Unset => None,
        SpanStatus::Ok => Some("ok".to_string()),
        SpanStatus::Error { description } => match description {
            Some(description) if !description.is_empty() => Some(description.clone()),
            _ => Some(error_status(record).to_string()),
        },
    }
}

/// Refines an error status with the HTTP status code attribute when present,
/// mirroring the canonical OTEL-to-protocol mapping table.
fn error_status(record: &SpanRecord) -> &'static str {
    let code = match record.attributes.get("http.status_code") {
        Some(AttributeValue::Int(code)) => *code,
        Some(AttributeValue::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    };

    match code {
        400 => "invalid_argument",
        401 => "unauthenticated",
        403 => "permission_denied",
        404 => "not_found",
        409 => "already_exists",
        429 => "resource_exhausted",
        499 => "cancelled",
        501 => "unimplemented",
        503 => "unavailable",
        504 => "deadline_exceeded",
        402..=499 => "invalid_argument",
        500..=599 => "internal_error",
        _ => "internal_error",
    }
}

/// Sub-events carrying a numeric `value` attribute become measurements,
/// keyed by event name.
fn measurements_from_events(record: &SpanRecord) -> HashMap<String, f64> {
    let mut measurements = HashMap::new();
    for event in &record.events {
        let value = match event.attributes.get("value") {
            Some(AttributeValue::Float(v)) => Some(*v),
            Some(AttributeValue::Int(v)) => Some(*v as f64),
            _ => None,
        };
        if let Some(value) = value {
            measurements.insert(event.name.clone(), value);
        }
    }
    measurements
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::SpanEvent;

    fn finished(trace_id: u128, span_id: u64, parent: Option<u64>, name: &str) -> SpanRecord {
        let mut record = SpanRecord::new(trace_id, span_id, parent, name, SpanKind::Internal);
        record.finish(SpanStatus::Ok);
        record
    }

    #[test]
    fn assembles_nested_tree() {
        let records = vec![
            finished(1, 1, None, "request"),
            finished(1, 2, Some(1), "query"),
            finished(1, 3, Some(2), "serialize"),
        ];
        let tree = SpanTree::build(&records);

        let (event, visited) = assemble(1, &tree).unwrap();
        assert_eq!(event.name, "request");
        assert_eq!(event.span_id, 1);
        assert_eq!(event.spans.len(), 2);
        assert_eq!(visited.len(), 3);

        let query = event.spans.iter().find(|s| s.span_id == 2).unwrap();
        let serialize = event.spans.iter().find(|s| s.span_id == 3).unwrap();
        assert_eq!(query.parent_span_id, 1);
        assert_eq!(serialize.parent_span_id, 2);
    }

    #[test]
    fn reparents_around_missing_interior_span() {
        // 1 <- 2 (malformed, contributes no output span) <- 3: span 3
        // re-parents to 1 and total output count is input minus one.
        let root = finished(1, 1, None, "root");
        let grandchild = finished(1, 3, Some(2), "leaf");
        let mut middle = finished(1, 2, Some(1), "middle");
        middle.end_unix_nanos = 0; // malformed: dropped from output

        let records = vec![root, middle, grandchild];
        let tree = SpanTree::build(&records);

        let (event, visited) = assemble(1, &tree).unwrap();
        assert_eq!(event.spans.len(), 1);
        assert_eq!(event.spans[0].span_id, 3);
        assert_eq!(event.spans[0].parent_span_id, 1);
        // The malformed node was still visited, so the processor can retire it.
        assert!(visited.contains(&2));
    }

    #[test]
    fn transaction_end_is_root_end() {
        let mut root = finished(1, 1, None, "root");
        root.end_unix_nanos = root.start_unix_nanos + 5_000;
        let mut child = finished(1, 2, Some(1), "child");
        child.end_unix_nanos = root.start_unix_nanos + 9_000; // outlives the root

        let tree = SpanTree::build([root.clone(), child].iter());
        let (event, _) = assemble(1, &tree).unwrap();
        assert_eq!(event.end_unix_nanos, root.end_unix_nanos);
    }

    #[test]
    fn error_status_refined_by_http_code() {
        let mut record = finished(1, 1, None, "request");
        record.status = SpanStatus::Error { description: None };
        record.set_attribute("http.status_code", AttributeValue::Int(404));
        assert_eq!(status_message(&record).unwrap(), "not_found");

        record.set_attribute("http.status_code", AttributeValue::Int(503));
        assert_eq!(status_message(&record).unwrap(), "unavailable");

        record.attributes.remove("http.status_code");
        assert_eq!(status_message(&record).unwrap(), "internal_error");
    }

    #[test]
    fn error_description_wins_over_http_code() {
        let mut record = finished(1, 1, None, "request");
        record.status = SpanStatus::Error {
            description: Some("deadline_exceeded".to_string()),
        };
        record.set_attribute("http.status_code", AttributeValue::Int(404));
        assert_eq!(status_message(&record).unwrap(), "deadline_exceeded");

        // An empty description carries no information; fall back to the code.
        record.status = SpanStatus::Error {
            description: Some(String::new()),
        };
        assert_eq!(status_message(&record).unwrap(), "not_found");
    }

    #[test]
    fn measurements_extracted_from_root_events() {
        let mut root = finished(1, 1, None, "pageload");
        let mut event = SpanEvent::new("first_paint", root.start_unix_nanos + 100);
        event.set_attribute("value", AttributeValue::Float(123.5));
        root.add_event(event);
        root.add_event(SpanEvent::new("unrelated", root.start_unix_nanos + 200));

        let tree = SpanTree::build(std::iter::once(&root));
        let (event, _) = assemble(1, &tree).unwrap();
        assert_eq!(event.measurements.len(), 1);
        assert_eq!(event.measurements["first_paint"], 123.5);
    }

    #[test]
    fn clamps_descendants_keeping_earliest() {
        let mut records = vec![finished(1, 1, None, "root")];
        for i in 0..(MAX_SPANS_PER_TRANSACTION as u64 + 50) {
            let mut child = finished(1, i + 2, Some(1), "child");
            // Later ids start later.
            child.start_unix_nanos = 1_000_000 + i;
            child.end_unix_nanos = child.start_unix_nanos + 10;
            records.push(child);
        }

        let tree = SpanTree::build(&records);
        let (event, _) = assemble(1, &tree).unwrap();
        assert_eq!(event.spans.len(), MAX_SPANS_PER_TRANSACTION);
        // Earliest-starting spans survive the clamp.
        assert!(event.spans.iter().all(|s| s.start_unix_nanos < 1_000_000 + MAX_SPANS_PER_TRANSACTION as u64));
    }
}
