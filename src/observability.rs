use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "wardsched_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "wardsched_query_duration_seconds";

/// Counter: booking requests by outcome (confirmed, held, preempting, conflict, rejected).
pub const BOOKING_REQUESTS_TOTAL: &str = "wardsched_booking_requests_total";

/// Counter: bookings displaced by an emergency.
pub const PREEMPTIONS_TOTAL: &str = "wardsched_preemptions_total";

/// Counter: lock waits that ran out and returned `Busy`.
pub const LOCK_TIMEOUTS_TOTAL: &str = "wardsched_lock_timeouts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "wardsched_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "wardsched_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "wardsched_connections_rejected_total";

/// Gauge: entries waiting on the waitlist.
pub const WAITLIST_DEPTH: &str = "wardsched_waitlist_depth";

/// Counter: waitlist entries turned into bookings.
pub const WAITLIST_PLACEMENTS_TOTAL: &str = "wardsched_waitlist_placements_total";

/// Counter: sweeper actions. Labels: action (expire_hold, complete).
pub const SWEEPER_ACTIONS_TOTAL: &str = "wardsched_sweeper_actions_total";

/// Histogram: ledger group-commit flush duration in seconds.
pub const LEDGER_FLUSH_DURATION_SECONDS: &str = "wardsched_ledger_flush_duration_seconds";

/// Histogram: ledger group-commit batch size (records per flush).
pub const LEDGER_FLUSH_BATCH_SIZE: &str = "wardsched_ledger_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
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
        Command::InsertResource { .. } => "insert_resource",
        Command::DeactivateResource { .. } => "deactivate_resource",
        Command::InsertOperatingHours { .. } => "insert_operating_hours",
        Command::ClearOperatingHours { .. } => "clear_operating_hours",
        Command::InsertBooking { .. } => "insert_booking",
        Command::InsertHold { .. } => "insert_hold",
        Command::ConfirmBooking { .. } => "confirm_booking",
        Command::CompleteBooking { .. } => "complete_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::InsertWaitlist { .. } => "insert_waitlist",
        Command::WithdrawWaitlist { .. } => "withdraw_waitlist",
        Command::SelectAvailability { .. } => "select_availability",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectHistory { .. } => "select_history",
        Command::SelectResources => "select_resources",
        Command::SelectWaitlist => "select_waitlist",
    }
}
