use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "hotdesk_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "hotdesk_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "hotdesk_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "hotdesk_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "hotdesk_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "hotdesk_tenants_active";

/// Counter: startup password and token failures. Labels: stage.
pub const AUTH_FAILURES_TOTAL: &str = "hotdesk_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "hotdesk_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "hotdesk_wal_flush_batch_size";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: bookings placed. Labels: kind.
pub const BOOKINGS_PLACED_TOTAL: &str = "hotdesk_bookings_placed_total";

/// Counter: reconciliation passes that committed a change.
pub const RECONCILE_RUNS_TOTAL: &str = "hotdesk_reconcile_runs_total";

/// Counter: bookings moved to COMPLETED by reconciliation. Labels: kind.
pub const RECONCILE_COMPLETED_TOTAL: &str = "hotdesk_reconcile_completed_total";

/// Counter: time slots released by reconciliation.
pub const RECONCILE_SLOTS_RELEASED_TOTAL: &str = "hotdesk_reconcile_slots_released_total";

/// Histogram: reconciliation pass duration in seconds.
pub const RECONCILE_DURATION_SECONDS: &str = "hotdesk_reconcile_duration_seconds";

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
        Command::InsertBranch { .. } => "insert_branch",
        Command::InsertSeatingType { .. } => "insert_seating_type",
        Command::InsertSeat { .. } => "insert_seat",
        Command::DeleteSeat { .. } => "delete_seat",
        Command::StartMaintenance { .. } => "start_maintenance",
        Command::EndMaintenance { .. } => "end_maintenance",
        Command::InsertAccount { .. } => "insert_account",
        Command::InsertBookings { .. } => "insert_bookings",
        Command::InsertPayment { .. } => "insert_payment",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::GenerateTimeSlots { .. } => "generate_time_slots",
        Command::SelectBranches => "select_branches",
        Command::SelectSeatingTypes => "select_seating_types",
        Command::SelectSeats { .. } => "select_seats",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectAccounts => "select_accounts",
        Command::SelectMe => "select_me",
        Command::SelectTimeSlots { .. } => "select_time_slots",
        Command::SelectFreeSeats { .. } => "select_free_seats",
        Command::VerifyBooking { .. } => "verify_booking",
        Command::ReconcileExpired => "reconcile_expired",
        Command::Login { .. } => "login",
        Command::Refresh { .. } => "refresh",
        Command::Logout { .. } => "logout",
        Command::SetToken { .. } => "set_token",
        Command::ResetToken => "reset_token",
    }
}
