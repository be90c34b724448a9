//! Trace assembly demo.
//!
//! Generates randomized traces, feeds them to the exporter in deliberately
//! out-of-order batches (children first), and prints each transaction as its
//! trace completes.
//!
//! Run with: `cargo run --bin trace_demo`

use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use trace_assembler::{
    now_unix_nanos, AttributeValue, ExporterConfig, ProcessorConfig, ScopeHandle, SpanIntake,
    SpanKind, SpanRecord, SpanStatus, StdoutTransport, TraceExporter,
};

/// Builds one finished trace: a root with a random number of children, each
/// child with a chance of one grandchild.
fn generate_trace(rng: &mut impl Rng, trace_seq: u64) -> Vec<SpanRecord> {
    let trace_id = u128::from(trace_seq) << 64 | u128::from(rng.gen::<u64>());
    let base = now_unix_nanos();
    let mut next_span_id = 1u64;
    let mut spans = Vec::new();

    let mut root = SpanRecord::new(trace_id, next_span_id, None, "http.request", SpanKind::Server);
    root.start_unix_nanos = base;
    root.set_attribute("http.method", AttributeValue::String("GET".to_string()));
    root.set_attribute(
        "http.url",
        AttributeValue::String(format!("/api/v1/resource/{trace_seq}")),
    );
    let root_id = next_span_id;

    let operations = ["db.query", "cache.get", "grpc.call", "queue.publish"];
    let child_count: u64 = rng.gen_range(2..6);
    let mut end = base;

    for i in 0..child_count {
        next_span_id += 1;
        let name = operations[rng.gen_range(0..operations.len())];
        let mut child = SpanRecord::new(trace_id, next_span_id, Some(root_id), name, SpanKind::Client);
        child.start_unix_nanos = base + i * 1_000_000;
        child.end_unix_nanos = child.start_unix_nanos + rng.gen_range(100_000..5_000_000);
        child.status = SpanStatus::Ok;
        end = end.max(child.end_unix_nanos);
        let child_id = next_span_id;
        spans.push(child);

        if rng.gen_bool(0.4) {
            next_span_id += 1;
            let mut grandchild =
                SpanRecord::new(trace_id, next_span_id, Some(child_id), "serialize", SpanKind::Internal);
            grandchild.start_unix_nanos = base + i * 1_000_000 + 50_000;
            grandchild.end_unix_nanos = grandchild.start_unix_nanos + rng.gen_range(10_000..100_000);
            grandchild.status = SpanStatus::Ok;
            spans.push(grandchild);
        }
    }

    root.end_unix_nanos = end + 500_000;
    root.status = SpanStatus::Ok;
    spans.push(root);

    // Children first, root last: the exporter has to buffer and reassemble.
    spans
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .init();

    println!("=== Trace Assembly Demo ===\n");

    let transport = Arc::new(StdoutTransport::new(true));
    let config = ExporterConfig::default()
        .with_flush_interval(Duration::from_millis(200))
        .with_processor(ProcessorConfig::default().with_max_pending_duration(Duration::from_secs(30)));
    let exporter = Arc::new(TraceExporter::new(config, transport));
    let mut intake = SpanIntake::new(exporter.clone());

    let mut rng = rand::thread_rng();
    let trace_count: u64 = 5;

    for trace_seq in 1..=trace_count {
        let spans = generate_trace(&mut rng, trace_seq);
        println!("Submitting trace {trace_seq} ({} spans, children first)", spans.len());

        for span in spans {
            intake.on_span_start(span.span_id, ScopeHandle::default(), span.parent_span_id);
            intake.on_span_end(span).await?;
        }

        tokio::time::sleep(Duration::from_millis(rng.gen_range(50..150))).await;
    }

    // One orphan whose parent never arrives, backdated past the staleness
    // threshold so the next flush evicts it.
    let mut orphan = SpanRecord::new(0xdead, 77, Some(999), "orphan.op", SpanKind::Internal);
    orphan.finish(SpanStatus::Ok);
    orphan.start_unix_nanos = now_unix_nanos().saturating_sub(60 * 1_000_000_000);
    intake.on_span_end(orphan).await?;

    exporter.force_flush().await?;

    let stats = exporter.stats();
    println!("\n=== Summary ===");
    println!("Transactions emitted: {}", stats.transactions_emitted());
    println!("Spans emitted:        {}", stats.spans_emitted());
    println!("Spans evicted:        {}", stats.spans_evicted());
    println!("Flush cycles:         {}", stats.flush_cycles());

    exporter.shutdown().await?;
    Ok(())
}
