//! Observability setup: structured logging and Prometheus metrics.

use std::time::Duration;

use meridian_txn::SchedulerStatsSnapshot;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber with structured logging.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,meridian=debug"));

    let fmt_layer = fmt::layer().with_target(true).with_thread_ids(true);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

/// Initialize the Prometheus metrics exporter.
pub fn init_metrics(listen_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr: std::net::SocketAddr = listen_addr.parse()?;
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("prometheus metrics endpoint on http://{}/metrics", addr);
    Ok(())
}

/// Export the scheduler counters. Called from the background loop, never
/// from the request path.
pub fn record_scheduler_metrics(snapshot: &SchedulerStatsSnapshot) {
    metrics::gauge!("meridian_scheduler_requested_operations_total", "operation" => "read")
        .set(snapshot.requested_reads as f64);
    metrics::gauge!("meridian_scheduler_requested_operations_total", "operation" => "write")
        .set(snapshot.requested_writes as f64);
    metrics::gauge!("meridian_scheduler_requested_operations_total", "operation" => "scan")
        .set(snapshot.requested_scans as f64);
    metrics::gauge!("meridian_scheduler_completed_operations_total", "operation" => "read")
        .set(snapshot.completed_reads as f64);
    metrics::gauge!("meridian_scheduler_completed_operations_total", "operation" => "write")
        .set(snapshot.completed_writes as f64);
    metrics::gauge!("meridian_scheduler_completed_operations_total", "operation" => "scan")
        .set(snapshot.completed_scans as f64);
    metrics::gauge!("meridian_scheduler_scan_interruptions_total")
        .set(snapshot.scan_interruptions as f64);
    metrics::gauge!("meridian_scheduler_scan_partial_completion_seconds")
        .set(snapshot.partial_completion_scan_seconds());
    metrics::gauge!("meridian_scheduler_current_write_delay")
        .set(snapshot.current_write_delay_seconds());
    metrics::gauge!("meridian_scheduler_max_write_delay").set(snapshot.max_write_delay_seconds());
}

/// Record one completed request.
pub fn record_command(command: &str, elapsed: Duration) {
    metrics::counter!("meridian_commands_total", "command" => command.to_string()).increment(1);
    metrics::histogram!("meridian_request_duration_seconds", "command" => command.to_string())
        .record(elapsed.as_secs_f64());
}

pub fn record_connection_opened() {
    metrics::counter!("meridian_connections_received_total").increment(1);
}
