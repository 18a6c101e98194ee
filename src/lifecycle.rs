use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{Engine, EngineError};
use crate::model::Ms;

/// Apply every status move due at `now`. Returns how many were written.
pub async fn sweep_once(engine: &Engine, now: Ms) -> usize {
    let mut applied = 0;
    for (id, status) in engine.collect_due_transitions(now) {
        match engine.set_assignment_status(id, status).await {
            Ok(_) => {
                debug!("assignment {id} -> {status}");
                applied += 1;
            }
            // Edited or removed since it was collected.
            Err(
                e @ (EngineError::NotFound(_)
                | EngineError::AssignmentClosed(_)
                | EngineError::InvalidTransition { .. }),
            ) => debug!("lifecycle skip {id}: {e}"),
            Err(e) => warn!("lifecycle cannot move assignment {id} to {status}: {e}"),
        }
    }
    applied
}

/// Background task that moves assignments along as the calendar advances:
/// planned work starts, active work completes.
pub async fn run_lifecycle(engine: Arc<Engine>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let applied = sweep_once(&engine, crate::engine::now_ms()).await;
        if applied > 0 {
            info!("lifecycle sweep applied {applied} status changes");
        }
    }
}

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("WAL compaction failed: {e}"),
        }
    }
}
