//! Trace Assembler
//!
//! Span-buffering and trace-assembly pipeline for a tracing SDK. Receives a
//! continuous, arbitrarily-ordered stream of finished spans, reconstructs
//! complete trace trees (children routinely finish before their parents),
//! emits each completed tree exactly once as a single aggregate transaction
//! event, and bounds memory by evicting trees that never complete.
//!
//! # Data flow
//!
//! [`SpanIntake`] -> pending buffer (owned by the [`TraceExporter`] worker)
//! -> on flush: [`SpanTree`] rebuild -> completed-root detection ->
//! [`assemble`] -> [`TransactionTransport`].
//!
//! Flush cycles run on a periodic timer, early when the buffer crosses a size
//! threshold, and on demand via force-flush or shutdown. Nothing here blocks
//! the instrumented application: intake and assembly are synchronous
//! in-memory operations, and transport handoff is fire-and-forget relative to
//! buffer mutation.

pub mod exporter;
pub mod intake;
pub mod processor;
pub mod span;
pub mod transaction;
pub mod transport;
pub mod tree;

// Re-export main types
pub use exporter::{ExportError, ExportStats, ExporterConfig, TraceExporter};
pub use intake::{ScopeHandle, SpanContext, SpanIntake};
pub use processor::{FlushMetrics, ProcessorConfig, TraceFlushProcessor};
pub use span::{
    now_unix_nanos, AttributeValue, SpanEvent, SpanId, SpanKind, SpanRecord, SpanStatus, TraceId,
};
pub use transaction::{assemble, AssembledSpan, TransactionEvent, MAX_SPANS_PER_TRANSACTION};
pub use transport::{
    JsonLinesTransport, NullTransport, StdoutTransport, TransactionTransport,
    TransactionTransportBoxed, TransportError,
};
pub use tree::{SpanNode, SpanTree};
