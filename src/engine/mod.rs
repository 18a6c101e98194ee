mod conflict;
mod error;
mod mutations;
mod queries;
mod utilization;

pub(crate) use conflict::now_ms;
pub use conflict::{
    check_capacity, find_conflicts, overlapping_allocation, validate_allocation,
    validate_allocation_pct, validate_capacity, validate_span,
};
pub use error::EngineError;
pub use utilization::{allocation_profile, current_utilization};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedEngineerState = Arc<RwLock<EngineerState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL. Appends that arrive while a flush is
/// pending are drained into the same batch and share one fsync.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch: Vec<PendingAppend> = vec![(event, response)];
        let mut deferred = None;
        while let Ok(next) = rx.try_recv() {
            match next {
                WalCommand::Append { event, response } => batch.push((event, response)),
                other => {
                    deferred = Some(other);
                    break;
                }
            }
        }

        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: Vec<PendingAppend>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let mut result = Ok(());
    for (event, _) in &batch {
        if let Err(e) = wal.append_buffered(event) {
            result = Err(e);
            break;
        }
    }
    // Flush even after a failed append so no half-written batch lingers in
    // the buffer; every sender in the batch sees the failure.
    let flushed = wal.flush_sync();
    if result.is_ok() {
        result = flushed;
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());

    for (_, tx) in batch {
        let reply = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(reply);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// Apply an assignment-level event to an engineer (caller holds the lock).
/// Engineer create/delete are handled at the map level, not here.
fn apply_to_engineer(es: &mut EngineerState, event: &Event, index: &DashMap<Ulid, Ulid>) {
    match event {
        Event::AssignmentCreated { assignment } => {
            index.insert(assignment.id, assignment.engineer_id);
            es.insert_assignment(assignment.clone());
        }
        Event::AssignmentUpdated { assignment } => {
            // Re-insert so the start-order invariant survives date edits.
            es.remove_assignment(assignment.id);
            es.insert_assignment(assignment.clone());
        }
        Event::AssignmentRemoved { id, .. } => {
            es.remove_assignment(*id);
            index.remove(id);
        }
        Event::AssignmentBatchCreated { assignments } => {
            let es_id = es.id;
            for assignment in assignments.iter().filter(|a| a.engineer_id == es_id) {
                index.insert(assignment.id, assignment.engineer_id);
                es.insert_assignment(assignment.clone());
            }
        }
        Event::EngineerUpdated {
            name, max_capacity, ..
        } => {
            es.name = name.clone();
            es.max_capacity = *max_capacity;
        }
        Event::EngineerCreated { .. } | Event::EngineerDeleted { .. } => {}
    }
}

/// Capacity ledger for one tenant: every engineer behind its own lock, every
/// change durably logged before it becomes visible.
pub struct Engine {
    pub state: DashMap<Ulid, SharedEngineerState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Reverse lookup: assignment id → engineer id
    pub(super) assignment_index: DashMap<Ulid, Ulid>,
    /// Mutations hold this shared; compaction takes it exclusively.
    pub(super) write_gate: RwLock<()>,
}

impl Engine {
    pub fn new(wal_path: PathBuf) -> io::Result<Self> {
        let (wal, events) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let assignment_index = DashMap::new();
        // Replay into plain state first; locks are only needed once shared.
        let mut engineers: HashMap<Ulid, EngineerState> = HashMap::new();
        for event in &events {
            match event {
                Event::EngineerCreated {
                    id,
                    name,
                    max_capacity,
                } => {
                    engineers.insert(*id, EngineerState::new(*id, name.clone(), *max_capacity));
                }
                Event::EngineerDeleted { id } => {
                    if let Some(es) = engineers.remove(id) {
                        for a in &es.assignments {
                            assignment_index.remove(&a.id);
                        }
                    }
                }
                Event::AssignmentBatchCreated { assignments } => {
                    for a in assignments {
                        if let Some(es) = engineers.get_mut(&a.engineer_id) {
                            assignment_index.insert(a.id, a.engineer_id);
                            es.insert_assignment(a.clone());
                        }
                    }
                }
                other => {
                    if let Some(eid) = other.engineer_id()
                        && let Some(es) = engineers.get_mut(&eid)
                    {
                        apply_to_engineer(es, other, &assignment_index);
                    }
                }
            }
        }

        if !events.is_empty() {
            info!(
                "replayed {} events: {} engineers, {} assignments",
                events.len(),
                engineers.len(),
                assignment_index.len()
            );
        }

        let state = DashMap::new();
        for (id, es) in engineers {
            state.insert(id, Arc::new(RwLock::new(es)));
        }

        Ok(Self {
            state,
            wal_tx,
            assignment_index,
            write_gate: RwLock::new(()),
        })
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_engineer(&self, id: &Ulid) -> Option<SharedEngineerState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub fn get_engineer_for_assignment(&self, assignment_id: &Ulid) -> Option<Ulid> {
        self.assignment_index.get(assignment_id).map(|e| *e.value())
    }

    /// WAL-append then apply while the caller holds the engineer lock.
    pub(super) async fn persist_and_apply(
        &self,
        es: &mut EngineerState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_engineer(es, event, &self.assignment_index);
        Ok(())
    }

    /// Lookup assignment → engineer, acquire the engineer's write lock.
    pub(super) async fn resolve_assignment_write(
        &self,
        assignment_id: &Ulid,
    ) -> Result<tokio::sync::OwnedRwLockWriteGuard<EngineerState>, EngineError> {
        let engineer_id = self
            .get_engineer_for_assignment(assignment_id)
            .ok_or(EngineError::NotFound(*assignment_id))?;
        let es = self
            .get_engineer(&engineer_id)
            .ok_or(EngineError::UnknownEngineer(engineer_id))?;
        let guard = es.write_owned().await;
        // Removed between the index lookup and acquiring the lock.
        if guard.get_assignment(*assignment_id).is_none() {
            return Err(EngineError::NotFound(*assignment_id));
        }
        Ok(guard)
    }
}
