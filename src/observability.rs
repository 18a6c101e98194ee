use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "capledger_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "capledger_query_duration_seconds";

/// Counter: writes refused because they would exceed an engineer's capacity.
pub const CAPACITY_REJECTIONS_TOTAL: &str = "capledger_capacity_rejections_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "capledger_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "capledger_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "capledger_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "capledger_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "capledger_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "capledger_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("failed to install Prometheus exporter: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertEngineer { .. } => "insert_engineer",
        Command::UpdateEngineer { .. } => "update_engineer",
        Command::DeleteEngineer { .. } => "delete_engineer",
        Command::InsertAssignment(_) => "insert_assignment",
        Command::BatchInsertAssignments(_) => "batch_insert_assignments",
        Command::UpdateAssignment { .. } => "update_assignment",
        Command::DeleteAssignment { .. } => "delete_assignment",
        Command::SelectEngineers => "select_engineers",
        Command::SelectAssignments { .. } => "select_assignments",
        Command::SelectConflicts { .. } => "select_conflicts",
        Command::SelectCapacityCheck { .. } => "select_capacity_check",
        Command::SelectUtilization { .. } => "select_utilization",
        Command::SelectAllocation { .. } => "select_allocation",
        Command::SelectAvailableEngineers { .. } => "select_available_engineers",
    }
}
