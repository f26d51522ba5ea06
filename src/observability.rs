use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "slotbook_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "slotbook_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "slotbook_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "slotbook_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "slotbook_connections_rejected_total";

/// Gauge: number of loaded tenants.
pub const TENANTS_ACTIVE: &str = "slotbook_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (frames per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

// ── Scheduling ──────────────────────────────────────────────────

pub const BUSY_CACHE_HITS_TOTAL: &str = "slotbook_busy_cache_hits_total";
pub const BUSY_CACHE_MISSES_TOTAL: &str = "slotbook_busy_cache_misses_total";

/// Counter: rejected assignment creations. Labels: kind (staff, area).
pub const COLLISIONS_TOTAL: &str = "slotbook_collisions_total";

/// Counter: requests or confirmations refused because the time was taken.
pub const CONFLICTS_TOTAL: &str = "slotbook_conflicts_total";

/// Counter: pending reservations cancelled by a competing confirmation.
pub const CASCADE_CANCELLATIONS_TOTAL: &str = "slotbook_cascade_cancellations_total";

/// Counter: external busy feed errors and timeouts. Labels: policy.
pub const FEED_FAILURES_TOTAL: &str = "slotbook_feed_failures_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!(error = %e, "failed to install Prometheus metrics exporter"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::SetScheduleDay { .. } => "set_schedule_day",
        Command::InsertAssignment(_) => "insert_assignment",
        Command::DisableAssignment { .. } => "disable_assignment",
        Command::RequestReservation { .. } => "request_reservation",
        Command::Confirm { .. } => "confirm",
        Command::MarkAttendance { .. } => "mark_attendance",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::PushExternalBusy { .. } => "push_external_busy",
        Command::RemoveExternalBusy { .. } => "remove_external_busy",
        Command::SelectSchedule => "select_schedule",
        Command::SelectSlots { .. } => "select_slots",
        Command::SelectBusy { .. } => "select_busy",
        Command::SelectAssignments { .. } => "select_assignments",
        Command::SelectReservations { .. } => "select_reservations",
    }
}
