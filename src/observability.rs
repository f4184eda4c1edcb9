use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: booking attempts. Labels: op, outcome.
pub const BOOKINGS_TOTAL: &str = "chairbook_bookings_total";

/// Counter: overlap rejections from the conflict detector. Labels: op.
pub const CONFLICTS_TOTAL: &str = "chairbook_conflicts_total";

/// Counter: status transitions. Labels: to.
pub const STATUS_TRANSITIONS_TOTAL: &str = "chairbook_status_transitions_total";

/// Histogram: availability snapshot latency in seconds.
pub const AVAILABILITY_DURATION_SECONDS: &str = "chairbook_availability_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Counter: reservation locks placed.
pub const LOCKS_PLACED_TOTAL: &str = "chairbook_locks_placed_total";

/// Counter: expired locks removed by the reaper.
pub const LOCKS_REAPED_TOTAL: &str = "chairbook_locks_reaped_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "chairbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "chairbook_wal_flush_batch_size";

/// Counter: WAL compactions performed.
pub const WAL_COMPACTIONS_TOTAL: &str = "chairbook_wal_compactions_total";

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`).
/// Safe to call more than once; later calls are ignored.
pub fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init_metrics(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
