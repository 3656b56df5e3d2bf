use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "facility_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "facility_query_duration_seconds";

/// Counter: authorization outcomes. Labels: operation, outcome (admit/deny/fail).
pub const DECISIONS_TOTAL: &str = "facility_decisions_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "facility_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "facility_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "facility_connections_rejected_total";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "facility_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "facility_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "facility_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
/// A failed install is logged and the server keeps running without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter on {addr}: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertFacility { .. } => "insert_facility",
        Command::InsertOperatingHours { .. } => "insert_operating_hours",
        Command::InsertRequest { .. } => "insert_request",
        Command::ApproveRequest { .. } => "approve_request",
        Command::RejectRequest { .. } => "reject_request",
        Command::SelectRequest { .. } => "select_request",
        Command::SelectRequestDetails { .. } => "select_request_details",
        Command::SelectFacility { .. } => "select_facility",
        Command::SelectAvailability { .. } => "select_availability",
    }
}
