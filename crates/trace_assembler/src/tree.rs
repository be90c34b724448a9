//! Tree Builder and Root Detector.
//!
//! [`SpanTree::build`] reconstructs the parent→children graph from the full
//! pending buffer on every flush. Rebuilding from scratch (rather than
//! patching an incremental index) keeps parent/child links trivially correct
//! across evictions and exports; the cost is O(n) over the buffer per flush,
//! which is fine at the batch sizes this pipeline sees.

use crate::span::{SpanId, SpanRecord};
use std::collections::HashMap;

/// One node per distinct span id seen in the buffer.
///
/// `record` is `None` for a placeholder: an id that was referenced as some
/// span's parent before (or without) that span itself arriving. Placeholders
/// are a deliberate state, not an error.
#[derive(Debug, Default)]
pub struct SpanNode {
    pub record: Option<SpanRecord>,
    pub parent: Option<SpanId>,
    pub children: Vec<SpanId>,
}

impl SpanNode {
    /// A completed root has a record and no parent node in the graph.
    pub fn is_completed_root(&self) -> bool {
        self.record.is_some() && self.parent.is_none()
    }
}

/// The full node graph for one flush pass, keyed by span id.
#[derive(Debug, Default)]
pub struct SpanTree {
    nodes: HashMap<SpanId, SpanNode>,
}

impl SpanTree {
    /// Builds the graph from the given records.
    ///
    /// First record arrival per id wins: a duplicate record for an id that
    /// already carries one is ignored, including its parent registration, so
    /// a child is attached to its parent exactly once.
    pub fn build<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a SpanRecord>,
    {
        let mut nodes: HashMap<SpanId, SpanNode> = HashMap::new();

        for record in records {
            let parent_id = record.effective_parent_id();

            let node = nodes.entry(record.span_id).or_default();
            if node.record.is_some() {
                continue;
            }
            node.record = Some(record.clone());
            node.parent = parent_id;

            if let Some(parent_id) = parent_id {
                nodes
                    .entry(parent_id)
                    .or_default()
                    .children
                    .push(record.span_id);
            }
        }

        Self { nodes }
    }

    pub fn node(&self, id: SpanId) -> Option<&SpanNode> {
        self.nodes.get(&id)
    }

    /// Ids of all flushable roots: nodes that carry a record and have no
    /// parent node. Multiple roots are normal (independent concurrent
    /// traces). A node whose parent exists only as a placeholder is not a
    /// root and stays pending.
    pub fn completed_roots(&self) -> Vec<SpanId> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.is_completed_root())
            .map(|(id, _)| *id)
            .collect()
    }

    /// Total node count, placeholders included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
