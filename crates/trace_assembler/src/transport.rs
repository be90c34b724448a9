//! Downstream transport boundary.
//!
//! The pipeline hands each completed [`TransactionEvent`] to a
//! [`TransactionTransport`]. Delivery is best-effort: failures are logged by
//! the flush controller and never propagated back into the span-creation hot
//! path.

use crate::transaction::TransactionEvent;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

/// Error types for transaction delivery.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    /// Transport-layer error (network, file system).
    #[error("transport error: {0}")]
    Io(String),
    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The transport has been closed and accepts no further events.
    #[error("transport is closed")]
    Closed,
}

/// Trait for delivering transaction events to a backend.
///
/// Uses native async fn in traits. The `impl Future` return types are not
/// object-safe; for dynamic dispatch use [`TransactionTransportBoxed`].
pub trait TransactionTransport: Send + Sync {
    /// Delivers one transaction event.
    fn send_transaction(
        &self,
        event: TransactionEvent,
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Flushes any delivery buffered inside the transport itself.
    fn flush(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Returns the transport name for debugging.
    fn name(&self) -> &str;
}

/// Object-safe version of [`TransactionTransport`] for dynamic dispatch.
pub trait TransactionTransportBoxed: Send + Sync {
    /// Delivers one transaction event (boxed future for object safety).
    fn send_transaction_boxed(
        &self,
        event: TransactionEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;

    /// Flushes any delivery buffered inside the transport itself.
    fn flush_boxed(&self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;

    /// Returns the transport name for debugging.
    fn name(&self) -> &str;
}

/// Blanket implementation: any TransactionTransport can be used boxed.
impl<T: TransactionTransport> TransactionTransportBoxed for T {
    fn send_transaction_boxed(
        &self,
        event: TransactionEvent,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(self.send_transaction(event))
    }

    fn flush_boxed(&self) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(self.flush())
    }

    fn name(&self) -> &str {
        TransactionTransport::name(self)
    }
}

/// Stdout transport for demos and debugging.
pub struct StdoutTransport {
    verbose: bool,
}

impl StdoutTransport {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl TransactionTransport for StdoutTransport {
    async fn send_transaction(&self, event: TransactionEvent) -> Result<(), TransportError> {
        if self.verbose {
            println!(
                "Transaction: trace_id={:032x} root={:016x} name={} spans={} duration={}ns",
                event.trace_id,
                event.span_id,
                event.name,
                event.spans.len(),
                event.end_unix_nanos.saturating_sub(event.start_unix_nanos),
            );
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "stdout"
    }
}

/// Appends each transaction as one JSON line, for local development.
pub struct JsonLinesTransport {
    file_path: String,
}

impl JsonLinesTransport {
    pub fn new(file_path: String) -> Self {
        Self { file_path }
    }
}

impl TransactionTransport for JsonLinesTransport {
    async fn send_transaction(&self, event: TransactionEvent) -> Result<(), TransportError> {
        let mut line = serde_json::to_string(&event)
            .map_err(|e| TransportError::Serialization(e.to_string()))?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;

        Ok(())
    }

    async fn flush(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "json_lines"
    }
}

/// Null transport that discards all transactions.
pub struct NullTransport;

impl NullTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NullTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionTransport for NullTransport {
    async fn send_transaction(&self, _event: TransactionEvent) -> Result<(), TransportError> {
        Ok(())
    }

    async fn flush(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn name(&self) -> &str {
        "null"
    }
}

/// Test transport that records delivered transactions for verification.
#[cfg(test)]
pub struct RecordingTransport {
    events: std::sync::Mutex<Vec<TransactionEvent>>,
    flushes: std::sync::atomic::AtomicU64,
}

#[cfg(test)]
impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            events: std::sync::Mutex::new(Vec::new()),
            flushes: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn transaction_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn all_transactions(&self) -> Vec<TransactionEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
impl TransactionTransport for RecordingTransport {
    async fn send_transaction(&self, event: TransactionEvent) -> Result<(), TransportError> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    async fn flush(&self) -> Result<(), TransportError> {
        self.flushes.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// Test transport that fails every delivery.
#[cfg(test)]
pub struct FailingTransport;

#[cfg(test)]
impl TransactionTransport for FailingTransport {
    async fn send_transaction(&self, _event: TransactionEvent) -> Result<(), TransportError> {
        Err(TransportError::Io("synthetic failure".to_string()))
    }

    async fn flush(&self) -> Result<(), TransportError> {
        Err(TransportError::Io("synthetic failure".to_string()))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::{SpanKind, SpanRecord, SpanStatus};
    use crate::transaction::assemble;
    use crate::tree::SpanTree;

    fn sample_event() -> TransactionEvent {
        let mut record = SpanRecord::new(1, 1, None, "request", SpanKind::Server);
        record.finish(SpanStatus::Ok);
        let tree = SpanTree::build(std::iter::once(&record));
        assemble(1, &tree).unwrap().0
    }

    #[tokio::test]
    async fn recording_transport_stores_events() {
        let transport = RecordingTransport::new();
        transport.send_transaction(sample_event()).await.unwrap();
        transport.flush().await.unwrap();

        assert_eq!(transport.transaction_count(), 1);
        assert_eq!(transport.flush_count(), 1);
    }

    #[tokio::test]
    async fn json_lines_transport_appends() {
        let path = std::env::temp_dir().join("trace_assembler_transport_test.jsonl");
        let _ = tokio::fs::remove_file(&path).await;

        let transport = JsonLinesTransport::new(path.to_string_lossy().into_owned());
        transport.send_transaction(sample_event()).await.unwrap();
        transport.send_transaction(sample_event()).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents.lines().count(), 2);
        let parsed: TransactionEvent = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(parsed.name, "request");

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn null_transport_discards() {
        let transport = NullTransport::new();
        transport.send_transaction(sample_event()).await.unwrap();
        assert_eq!(TransactionTransport::name(&transport), "null");
    }
}
