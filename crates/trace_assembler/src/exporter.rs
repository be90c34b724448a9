//! Flush controller.
//!
//! [`TraceExporter`] bridges the synchronous intake side with async delivery.
//! All pending-buffer mutation is routed through a single worker task fed by
//! a command channel, which enforces the one-flush-in-flight-at-a-time rule
//! by construction: there is no lock to get wrong because there is exactly
//! one owner.
//!
//! Flush cycles run on a periodic interval, early when the buffer crosses its
//! size threshold, and on demand via [`TraceExporter::force_flush`]. An
//! out-of-schedule flush resets the interval so no redundant flush fires
//! right after. A flush runs to completion once started; it is a synchronous,
//! bounded-size operation.

use crate::processor::{ProcessorConfig, TraceFlushProcessor};
use crate::span::{now_unix_nanos, SpanRecord};
use crate::transaction::TransactionEvent;
use crate::transport::TransactionTransportBoxed;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::warn;

/// Error types for export operations.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ExportError {
    /// The exporter has been shut down. Terminal: no later call can succeed.
    #[error("exporter is stopped")]
    Stopped,
    /// The worker task is gone (panicked or dropped).
    #[error("exporter worker is unavailable")]
    Closed,
}

impl ExportError {
    /// Returns `true` if this error indicates the exporter is permanently
    /// unusable.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Closed)
    }
}

/// Configuration for the flush controller.
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    /// Periodic flush interval.
    pub flush_interval: Duration,
    /// Flush processor configuration (eviction threshold, size threshold).
    pub processor: ProcessorConfig,
    /// Command channel capacity between intake and the worker.
    pub command_buffer: usize,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(5),
            processor: ProcessorConfig::default(),
            command_buffer: 1024,
        }
    }
}

impl ExporterConfig {
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_processor(mut self, processor: ProcessorConfig) -> Self {
        self.processor = processor;
        self
    }
}

/// Thread-safe counters observable from outside the worker task.
///
/// The processor keeps its own plain-u64 [`crate::processor::FlushMetrics`]
/// for sequential use; these atomics exist so callers can watch progress
/// while the worker owns the processor.
#[derive(Debug, Default)]
pub struct ExportStats {
    transactions_emitted: AtomicU64,
    spans_emitted: AtomicU64,
    spans_evicted: AtomicU64,
    flush_cycles: AtomicU64,
}

impl ExportStats {
    pub fn transactions_emitted(&self) -> u64 {
        self.transactions_emitted.load(Ordering::Relaxed)
    }

    pub fn spans_emitted(&self) -> u64 {
        self.spans_emitted.load(Ordering::Relaxed)
    }

    pub fn spans_evicted(&self) -> u64 {
        self.spans_evicted.load(Ordering::Relaxed)
    }

    pub fn flush_cycles(&self) -> u64 {
        self.flush_cycles.load(Ordering::Relaxed)
    }

    fn record_cycle(&self, events: &[TransactionEvent], evicted: usize) {
        self.flush_cycles.fetch_add(1, Ordering::Relaxed);
        self.transactions_emitted
            .fetch_add(events.len() as u64, Ordering::Relaxed);
        let spans: u64 = events.iter().map(|e| 1 + e.spans.len() as u64).sum();
        self.spans_emitted.fetch_add(spans, Ordering::Relaxed);
        self.spans_evicted.fetch_add(evicted as u64, Ordering::Relaxed);
    }
}

enum Command {
    Export(Vec<SpanRecord>),
    ForceFlush(oneshot::Sender<()>),
}

/// Owns the worker task that runs flush cycles and hands completed
/// transactions to the transport.
pub struct TraceExporter {
    cmd_tx: mpsc::Sender<Command>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    stopped: Arc<AtomicBool>,
    stats: Arc<ExportStats>,
}

impl TraceExporter {
    /// Spawns the worker task. Must be called within a tokio runtime.
    pub fn new(config: ExporterConfig, transport: Arc<dyn TransactionTransportBoxed>) -> Self {
        let (cmd_tx, mut cmd_rx) = mpsc::channel(config.command_buffer);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let stats = Arc::new(ExportStats::default());

        let stats_clone = Arc::clone(&stats);
        let flush_interval = config.flush_interval;
        let processor_config = config.processor;

        let worker = tokio::spawn(async move {
            let mut processor = TraceFlushProcessor::new(processor_config);

            // Start one period in the future; an immediate tick would just
            // flush an empty buffer.
            let mut interval =
                tokio::time::interval_at(tokio::time::Instant::now() + flush_interval, flush_interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    cmd = cmd_rx.recv() => match cmd {
                        Some(Command::Export(batch)) => {
                            processor.merge(batch);
                            if processor.should_flush_early() {
                                run_flush(&mut processor, &transport, &stats_clone, false).await;
                                interval.reset();
                            }
                        }
                        Some(Command::ForceFlush(ack)) => {
                            run_flush(&mut processor, &transport, &stats_clone, true).await;
                            if let Err(e) = transport.flush_boxed().await {
                                warn!(error = %e, transport = transport.name(), "transport flush failed");
                            }
                            interval.reset();
                            let _ = ack.send(());
                        }
                        // All senders are gone: the exporter handle was
                        // dropped without shutdown. Nothing can arrive, so
                        // stop ticking and let the task exit.
                        None => break,
                    },

                    _ = interval.tick() => {
                        run_flush(&mut processor, &transport, &stats_clone, false).await;
                    }

                    _ = &mut shutdown_rx => {
                        // Drain commands that were queued before the shutdown
                        // signal won the race.
                        let mut pending_acks = Vec::new();
                        while let Ok(cmd) = cmd_rx.try_recv() {
                            match cmd {
                                Command::Export(batch) => processor.merge(batch),
                                Command::ForceFlush(ack) => pending_acks.push(ack),
                            }
                        }

                        // Best-effort final flush: assemble what is complete,
                        // no final eviction pass, then flush the transport.
                        let events = processor.assemble_completed();
                        stats_clone.record_cycle(&events, 0);
                        for event in events {
                            if let Err(e) = transport.send_transaction_boxed(event).await {
                                warn!(error = %e, "transaction delivery failed during shutdown");
                            }
                        }
                        if let Err(e) = transport.flush_boxed().await {
                            warn!(error = %e, "transport flush failed during shutdown");
                        }
                        for ack in pending_acks {
                            let _ = ack.send(());
                        }
                        break;
                    }
                }
            }
        });

        Self {
            cmd_tx,
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            worker: Mutex::new(Some(worker)),
            stopped: Arc::new(AtomicBool::new(false)),
            stats,
        }
    }

    /// Admits a batch of finished spans into the pending buffer.
    ///
    /// Fails fast with [`ExportError::Stopped`] after shutdown rather than
    /// panicking; tracing must never crash the host application.
    pub async fn export(&self, records: Vec<SpanRecord>) -> Result<(), ExportError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ExportError::Stopped);
        }
        self.cmd_tx
            .send(Command::Export(records))
            .await
            .map_err(|_| ExportError::Closed)
    }

    /// Drains the current buffer through the transport and waits for the
    /// transport's own flush to complete before returning.
    pub async fn force_flush(&self) -> Result<(), ExportError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ExportError::Stopped);
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::ForceFlush(ack_tx))
            .await
            .map_err(|_| ExportError::Closed)?;
        ack_rx.await.map_err(|_| ExportError::Closed)
    }

    /// Stops accepting new exports, performs one best-effort final flush of
    /// the transport, and cancels the flush timer. Idempotent.
    pub async fn shutdown(&self) -> Result<(), ExportError> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(tx) = self.shutdown_tx.lock().ok().and_then(|mut tx| tx.take()) {
            let _ = tx.send(());
        }

        let handle = self.worker.lock().ok().and_then(|mut worker| worker.take());
        if let Some(handle) = handle {
            handle.await.map_err(|_| ExportError::Closed)?;
        }
        Ok(())
    }

    /// Counters updated by the worker after every flush cycle.
    pub fn stats(&self) -> &Arc<ExportStats> {
        &self.stats
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// One flush cycle: assemble, evict, hand off to the transport.
///
/// The buffer is fully updated before any transport call is issued; delivery
/// is fire-and-forget unless `awaited` (force-flush path), and failures are
/// logged, never propagated upstream.
async fn run_flush(
    processor: &mut TraceFlushProcessor,
    transport: &Arc<dyn TransactionTransportBoxed>,
    stats: &ExportStats,
    awaited: bool,
) {
    let events = processor.assemble_completed();
    let evicted = processor.evict_stale(now_unix_nanos());
    stats.record_cycle(&events, evicted);

    for event in events {
        if awaited {
            if let Err(e) = transport.send_transaction_boxed(event).await {
                warn!(error = %e, transport = transport.name(), "transaction delivery failed");
            }
        } else {
            let transport = Arc::clone(transport);
            tokio::spawn(async move {
                if let Err(e) = transport.send_transaction_boxed(event).await {
                    warn!(error = %e, "transaction delivery failed");
                }
            });
        }
    }
}
