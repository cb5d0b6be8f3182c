use std::net::SocketAddr;

use crate::sql::Command;

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: bookings accepted and committed.
pub const BOOKINGS_CREATED_TOTAL: &str = "fieldbook_bookings_created_total";

/// Counter: candidate windows rejected. Labels: rule.
pub const REJECTIONS_TOTAL: &str = "fieldbook_rejections_total";

/// Counter: slot searches. Labels: outcome (found, not_found).
pub const SUGGESTIONS_TOTAL: &str = "fieldbook_suggestions_total";

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "fieldbook_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "fieldbook_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "fieldbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "fieldbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "fieldbook_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "fieldbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "fieldbook_wal_flush_batch_size";

/// Counter: background compactions. Labels: status.
pub const WAL_COMPACTIONS_TOTAL: &str = "fieldbook_wal_compactions_total";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short label for a command, used on every query metric.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertBooking(_) => "insert_booking",
        Command::SelectDay { .. } => "select_day",
        Command::SelectBooking { .. } => "select_booking",
        Command::SelectSuggestion(_) => "select_suggestion",
        Command::SelectRateTier { .. } => "select_rate_tier",
        Command::UpdateStatus { .. } => "update_status",
        Command::DeleteBooking { .. } => "delete_booking",
    }
}
