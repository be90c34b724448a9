//! Flush Processor - Pure Trace Assembly
//!
//! This module owns the pending buffer and runs one flush cycle at a time:
//! merge newly finished spans, rebuild the span tree over the *entire*
//! buffer, assemble every completed root into a transaction, then evict
//! records that have been pending longer than the configured threshold.
//!
//! Concurrency is an orthogonal concern and deliberately lives elsewhere
//! (see [`crate::exporter`]): this type holds no `Arc`, no atomics, and no
//! transport handle. `flush` takes the wall-clock "now" as a parameter so
//! eviction is testable with simulated time.

use crate::span::{SpanId, SpanRecord};
use crate::transaction::{assemble, TransactionEvent};
use crate::tree::SpanTree;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Configuration for the flush processor.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// How long a span may sit in the pending buffer before it is evicted,
    /// measured from the span's start timestamp. Bounds memory against
    /// permanently orphaned subtrees.
    pub max_pending_duration: Duration,
    /// Buffer size at which a flush should run ahead of schedule.
    pub max_buffered_spans: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            max_pending_duration: Duration::from_secs(300),
            max_buffered_spans: 10_000,
        }
    }
}

impl ProcessorConfig {
    /// Sets the eviction threshold.
    pub fn with_max_pending_duration(mut self, duration: Duration) -> Self {
        self.max_pending_duration = duration;
        self
    }

    /// Sets the early-flush buffer threshold.
    pub fn with_max_buffered_spans(mut self, limit: usize) -> Self {
        self.max_buffered_spans = limit;
        self
    }
}

/// Metrics for flush processing (plain u64 - no atomic overhead for
/// sequential use).
#[derive(Debug, Default, Clone)]
pub struct FlushMetrics {
    /// Transactions handed to the caller.
    pub transactions_emitted: u64,
    /// Descendant + root spans included in emitted transactions.
    pub spans_emitted: u64,
    /// Spans dropped by the staleness policy.
    pub spans_evicted: u64,
    /// Completed flush cycles.
    pub flush_cycles: u64,
}

/// Owns the pending buffer and turns completed trace trees into
/// transaction events.
///
/// A span admitted here reaches exactly one of two terminal states: included
/// in an emitted transaction, or evicted as stale. Never both, never twice.
pub struct TraceFlushProcessor {
    /// Not-yet-exported records, keyed by span id.
    pending: HashMap<SpanId, SpanRecord>,
    config: ProcessorConfig,
    metrics: FlushMetrics,
}

impl TraceFlushProcessor {
    pub fn new(config: ProcessorConfig) -> Self {
        Self {
            pending: HashMap::new(),
            config,
            metrics: FlushMetrics::default(),
        }
    }

    /// Admits a batch of newly finished spans. First arrival wins: a record
    /// whose span id is already buffered is ignored.
    pub fn merge(&mut self, batch: Vec<SpanRecord>) {
        for record in batch {
            self.pending.entry(record.span_id).or_insert(record);
        }
    }

    /// Number of records currently buffered.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether the buffer has crossed the size threshold and should be
    /// flushed ahead of the periodic timer.
    pub fn should_flush_early(&self) -> bool {
        self.pending.len() >= self.config.max_buffered_spans
    }

    /// Runs one full flush cycle: assemble completed traces, then evict
    /// stale records. Returns the events to hand to the transport.
    pub fn flush(&mut self, now_unix_nanos: u64) -> Vec<TransactionEvent> {
        let events = self.assemble_completed();
        self.evict_stale(now_unix_nanos);
        self.metrics.flush_cycles += 1;
        events
    }

    /// Rebuilds the span tree from the full buffer, assembles every
    /// completed root, and removes all visited spans from the buffer.
    ///
    /// Used directly (without eviction) for the final best-effort flush at
    /// shutdown.
    pub fn assemble_completed(&mut self) -> Vec<TransactionEvent> {
        if self.pending.is_empty() {
            return Vec::new();
        }

        let tree = SpanTree::build(self.pending.values());
        let mut events = Vec::new();

        for root_id in tree.completed_roots() {
            if let Some((event, visited)) = assemble(root_id, &tree) {
                for id in visited {
                    self.pending.remove(&id);
                }
                self.metrics.transactions_emitted += 1;
                self.metrics.spans_emitted += 1 + event.spans.len() as u64;
                events.push(event);
            }
        }

        debug!(
            emitted = events.len(),
            waiting = self.pending.len(),
            "flush assembled transactions; remaining spans wait for their parents"
        );

        events
    }

    /// Drops every record whose start timestamp is older than now minus
    /// `max_pending_duration`, independent of whether its tree might still
    /// complete. Returns the number of evicted records.
    pub fn evict_stale(&mut self, now_unix_nanos: u64) -> usize {
        let cutoff = now_unix_nanos.saturating_sub(self.config.max_pending_duration.as_nanos() as u64);

        let before = self.pending.len();
        self.pending.retain(|span_id, record| {
            let keep = record.start_unix_nanos >= cutoff;
            if !keep {
                debug!(
                    span_id,
                    name = %record.name,
                    "dropping span pending longer than the staleness threshold"
                );
            }
            keep
        });

        let evicted = before - self.pending.len();
        if evicted > 0 {
            debug!(
                evicted,
                remaining = self.pending.len(),
                "evicted stale spans this cycle"
            );
        }
        self.metrics.spans_evicted += evicted as u64;
        evicted
    }

    pub fn metrics(&self) -> &FlushMetrics {
        &self.metrics
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }
}
