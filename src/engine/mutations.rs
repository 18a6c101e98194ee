use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{RwLock, oneshot};
use tracing::debug;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{
    overlapping_allocation, validate_allocation, validate_allocation_pct, validate_capacity,
    validate_span,
};
use super::{Engine, EngineError, WalCommand, apply_to_engineer};

/// Run the allocation validator against a locked engineer snapshot.
fn enforce_capacity<'a>(
    es: &EngineerState,
    assignments: impl IntoIterator<Item = &'a Assignment>,
    span: &Span,
    allocation: u32,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let result = validate_allocation(assignments, es.id, span, allocation, es.max_capacity, exclude);
    if let Err(EngineError::CapacityExceeded { current, requested, max }) = &result {
        metrics::counter!(crate::observability::CAPACITY_REJECTIONS_TOTAL).increment(1);
        debug!(
            "rejected {requested}% for engineer {} over [{}, {}]: {current}% of {max}% taken",
            es.id, span.start, span.end
        );
    }
    result
}

/// Load as the validator sees it: for each committed assignment, what
/// overlaps it plus its own allocation. A cap at or above this keeps every
/// committed assignment re-validatable.
fn validated_load(es: &EngineerState) -> u32 {
    es.committed()
        .map(|a| {
            overlapping_allocation(es.overlapping(a.span), es.id, &a.span, Some(a.id))
                + a.allocation
        })
        .max()
        .unwrap_or(0)
}

impl Engine {
    pub async fn create_engineer(
        &self,
        id: Ulid,
        name: Option<String>,
        max_capacity: u32,
    ) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        if self.state.len() >= MAX_ENGINEERS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many engineers"));
        }
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("engineer name too long"));
        }
        validate_capacity(max_capacity)?;
        if self.state.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let event = Event::EngineerCreated {
            id,
            name: name.clone(),
            max_capacity,
        };
        self.wal_append(&event).await?;
        let es = EngineerState::new(id, name, max_capacity);
        self.state.insert(id, Arc::new(RwLock::new(es)));
        Ok(())
    }

    /// Rename or re-cap an engineer. `None` keeps the stored value. Lowering
    /// the cap below the engineer's validated load is rejected; `current` in
    /// the error is that load.
    pub async fn update_engineer(
        &self,
        id: Ulid,
        name: Option<String>,
        max_capacity: Option<u32>,
    ) -> Result<EngineerInfo, EngineError> {
        let _gate = self.write_gate.read().await;
        if let Some(ref n) = name
            && n.len() > MAX_NAME_LEN
        {
            return Err(EngineError::LimitExceeded("engineer name too long"));
        }
        if let Some(cap) = max_capacity {
            validate_capacity(cap)?;
        }
        let es = self
            .get_engineer(&id)
            .ok_or(EngineError::UnknownEngineer(id))?;
        let mut guard = es.write().await;

        let name = name.or_else(|| guard.name.clone());
        let max_capacity = max_capacity.unwrap_or(guard.max_capacity);
        if max_capacity < guard.max_capacity {
            let load = validated_load(&guard);
            if load > max_capacity {
                return Err(EngineError::CapacityExceeded {
                    current: load,
                    requested: 0,
                    max: max_capacity,
                });
            }
        }

        let event = Event::EngineerUpdated {
            id,
            name,
            max_capacity,
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(guard.info())
    }

    /// Delete an engineer whose remaining assignments are all completed or
    /// cancelled. That history goes with them.
    pub async fn delete_engineer(&self, id: Ulid) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        let es = self
            .get_engineer(&id)
            .ok_or(EngineError::UnknownEngineer(id))?;
        let guard = es.write().await;
        if guard.committed().next().is_some() {
            return Err(EngineError::HasAssignments(id));
        }

        let event = Event::EngineerDeleted { id };
        self.wal_append(&event).await?;
        for a in &guard.assignments {
            self.assignment_index.remove(&a.id);
        }
        self.state.remove(&id);
        Ok(())
    }

    pub async fn create_assignment(&self, new: NewAssignment) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        validate_span(new.span.start, new.span.end)?;
        validate_allocation_pct(new.allocation)?;
        let es = self
            .get_engineer(&new.engineer_id)
            .ok_or(EngineError::UnknownEngineer(new.engineer_id))?;
        let mut guard = es.write().await;
        if guard.assignments.len() >= MAX_ASSIGNMENTS_PER_ENGINEER {
            return Err(EngineError::LimitExceeded("too many assignments for engineer"));
        }
        if self.assignment_index.contains_key(&new.id) {
            return Err(EngineError::AlreadyExists(new.id));
        }

        if new.status.counts_toward_capacity() {
            enforce_capacity(&guard, guard.overlapping(new.span), &new.span, new.allocation, None)?;
        }

        let event = Event::AssignmentCreated {
            assignment: new.into_assignment(),
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Create several assignments atomically. All-or-nothing: each row is
    /// validated against stored state plus the earlier rows of the batch, and
    /// the whole batch goes to the WAL as one record, so it is durable and
    /// applied entirely or not at all. Rows may target different engineers.
    pub async fn batch_create_assignments(
        &self,
        batch: Vec<NewAssignment>,
    ) -> Result<(), EngineError> {
        if batch.is_empty() {
            return Ok(());
        }
        if batch.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        let mut seen = HashSet::new();
        for new in &batch {
            validate_span(new.span.start, new.span.end)?;
            validate_allocation_pct(new.allocation)?;
            if !seen.insert(new.id) {
                return Err(EngineError::AlreadyExists(new.id));
            }
        }

        let _gate = self.write_gate.read().await;

        // Acquire write locks in sorted order to prevent deadlocks.
        let mut engineer_ids: Vec<Ulid> = batch.iter().map(|n| n.engineer_id).collect();
        engineer_ids.sort();
        engineer_ids.dedup();

        let mut guards = Vec::with_capacity(engineer_ids.len());
        let mut slot: HashMap<Ulid, usize> = HashMap::new();
        for eid in &engineer_ids {
            let es = self
                .get_engineer(eid)
                .ok_or(EngineError::UnknownEngineer(*eid))?;
            let guard = es.write_owned().await;
            slot.insert(*eid, guards.len());
            guards.push(guard);
        }

        // Phase 1: validate against a working copy per engineer.
        let mut working: Vec<Vec<Assignment>> =
            guards.iter().map(|g| g.assignments.clone()).collect();
        for new in &batch {
            if self.assignment_index.contains_key(&new.id) {
                return Err(EngineError::AlreadyExists(new.id));
            }
            let idx = slot[&new.engineer_id];
            if working[idx].len() >= MAX_ASSIGNMENTS_PER_ENGINEER {
                return Err(EngineError::LimitExceeded("too many assignments for engineer"));
            }
            if new.status.counts_toward_capacity() {
                enforce_capacity(&guards[idx], &working[idx], &new.span, new.allocation, None)?;
            }
            working[idx].push(new.clone().into_assignment());
        }

        // Phase 2: every row fits, commit.
        let event = Event::AssignmentBatchCreated {
            assignments: batch.into_iter().map(NewAssignment::into_assignment).collect(),
        };
        self.wal_append(&event).await?;
        for guard in guards.iter_mut() {
            apply_to_engineer(guard, &event, &self.assignment_index);
        }

        Ok(())
    }

    /// Patch an assignment in place. Completed and cancelled assignments are
    /// frozen and status moves must follow the lifecycle. A result that
    /// counts toward capacity is re-validated excluding itself, unless the
    /// edit leaves its planned/active load untouched.
    pub async fn update_assignment(
        &self,
        id: Ulid,
        patch: AssignmentPatch,
    ) -> Result<Assignment, EngineError> {
        let _gate = self.write_gate.read().await;
        let mut guard = self.resolve_assignment_write(&id).await?;
        let current = guard
            .get_assignment(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))?;

        if patch.is_empty() || patch == AssignmentPatch::status(current.status) {
            return Ok(current);
        }
        if current.status.is_terminal() {
            return Err(EngineError::AssignmentClosed(id));
        }

        let status = patch.status.unwrap_or(current.status);
        if !current.status.can_transition_to(status) {
            return Err(EngineError::InvalidTransition {
                from: current.status,
                to: status,
            });
        }
        let span = validate_span(
            patch.start.unwrap_or(current.span.start),
            patch.end.unwrap_or(current.span.end),
        )?;
        let allocation = patch.allocation.unwrap_or(current.allocation);
        validate_allocation_pct(allocation)?;

        let updated = Assignment {
            id,
            engineer_id: current.engineer_id,
            project_id: patch.project_id.unwrap_or(current.project_id),
            allocation,
            span,
            status,
        };
        if updated == current {
            return Ok(current);
        }

        // Moving between committed statuses with the same dates and
        // allocation leaves the load unchanged; nothing to re-check.
        let same_load = current.status.counts_toward_capacity()
            && span == current.span
            && allocation == current.allocation;
        if status.counts_toward_capacity() && !same_load {
            enforce_capacity(&guard, guard.overlapping(span), &span, allocation, Some(id))?;
        }

        let event = Event::AssignmentUpdated {
            assignment: updated.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(updated)
    }

    pub async fn set_assignment_status(
        &self,
        id: Ulid,
        status: AssignmentStatus,
    ) -> Result<Assignment, EngineError> {
        self.update_assignment(id, AssignmentPatch::status(status))
            .await
    }

    /// Soft delete: the assignment stays on record but stops consuming capacity.
    pub async fn cancel_assignment(&self, id: Ulid) -> Result<Assignment, EngineError> {
        self.set_assignment_status(id, AssignmentStatus::Cancelled)
            .await
    }

    /// Hard delete. Returns the engineer the assignment belonged to.
    pub async fn remove_assignment(&self, id: Ulid) -> Result<Ulid, EngineError> {
        let _gate = self.write_gate.read().await;
        let mut guard = self.resolve_assignment_write(&id).await?;
        let engineer_id = guard.id;
        let event = Event::AssignmentRemoved { id, engineer_id };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok(engineer_id)
    }

    /// Status moves that are due at `now`: planned work whose start has been
    /// reached becomes active; active work whose end has passed completes.
    /// Planned work that is already over gets both steps, in order.
    /// Engineers whose lock is busy are skipped until the next sweep.
    pub fn collect_due_transitions(&self, now: Ms) -> Vec<(Ulid, AssignmentStatus)> {
        let mut due = Vec::new();
        for entry in self.state.iter() {
            let es = entry.value().clone();
            let Ok(guard) = es.try_read() else { continue };
            for a in &guard.assignments {
                match a.status {
                    AssignmentStatus::Planned if a.span.start <= now => {
                        due.push((a.id, AssignmentStatus::Active));
                        if a.span.end < now {
                            due.push((a.id, AssignmentStatus::Completed));
                        }
                    }
                    AssignmentStatus::Active if a.span.end < now => {
                        due.push((a.id, AssignmentStatus::Completed));
                    }
                    _ => {}
                }
            }
        }
        due
    }

    /// Rewrite the WAL with only the events needed to recreate the current
    /// state. Writers are held off for the duration so nothing appended
    /// between the snapshot and the swap can be lost.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.write_gate.write().await;

        let engineers: Vec<_> = self.state.iter().map(|e| e.value().clone()).collect();
        let mut events = Vec::new();
        for es in engineers {
            let guard = es.read().await;
            events.push(Event::EngineerCreated {
                id: guard.id,
                name: guard.name.clone(),
                max_capacity: guard.max_capacity,
            });
            for a in &guard.assignments {
                events.push(Event::AssignmentCreated {
                    assignment: a.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
