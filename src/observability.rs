use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "labslot_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "labslot_query_duration_seconds";

/// Counter: reservations created.
pub const RESERVATIONS_CREATED_TOTAL: &str = "labslot_reservations_created_total";

/// Counter: reservations cancelled.
pub const RESERVATIONS_CANCELLED_TOTAL: &str = "labslot_reservations_cancelled_total";

/// Counter: rejected or failed creates/cancels. Labels: op, reason.
pub const RESERVATION_REJECTIONS_TOTAL: &str = "labslot_reservation_rejections_total";

/// Counter: change notifications written to LISTENing connections.
pub const NOTIFICATIONS_DELIVERED_TOTAL: &str = "labslot_notifications_delivered_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "labslot_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "labslot_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "labslot_connections_rejected_total";

/// Gauge: live reservations in the table.
pub const RESERVATIONS_ACTIVE: &str = "labslot_reservations_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "labslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "labslot_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
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
        Command::InsertReservation(_) => "insert_reservation",
        Command::DeleteReservation(_) => "delete_reservation",
        Command::SelectReservations(_) => "select_reservations",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectStations => "select_stations",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
