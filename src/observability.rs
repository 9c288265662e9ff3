use std::net::SocketAddr;

use metrics_exporter_prometheus::BuildError;

use crate::command::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: protocol requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "reservo_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "reservo_request_duration_seconds";

/// Counter: booking attempts. Labels: outcome.
pub const BOOKINGS_TOTAL: &str = "reservo_bookings_total";

/// Histogram: end-to-end booking attempt latency in seconds.
pub const BOOKING_DURATION_SECONDS: &str = "reservo_booking_duration_seconds";

/// Counter: cancellations. Labels: outcome (removed, absent).
pub const CANCELLATIONS_TOTAL: &str = "reservo_cancellations_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "reservo_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "reservo_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "reservo_connections_rejected_total";

/// Gauge: live availability and ownership watches.
pub const WATCHES_ACTIVE: &str = "reservo_watches_active";

/// Counter: watch pushes replaced by a newer snapshot before the client read them.
pub const PUSHES_COALESCED_TOTAL: &str = "reservo_pushes_coalesced_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "reservo_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "reservo_wal_flush_batch_size";

/// Counter: WAL compactions. Labels: status.
pub const COMPACTIONS_TOTAL: &str = "reservo_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::Login { .. } => "login",
        Command::Logout => "logout",
        Command::Availability { .. } => "availability",
        Command::Watch { .. } => "watch",
        Command::Unwatch { .. } => "unwatch",
        Command::Book(_) => "book",
        Command::Cancel(_) => "cancel",
        Command::Mine => "mine",
        Command::WatchMine => "watch_mine",
    }
}
