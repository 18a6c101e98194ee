use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::{self, validate_allocation_pct, validate_span};
use super::utilization::{self, current_utilization};
use super::{Engine, EngineError, SharedEngineerState};

fn query_window(start: Ms, end: Ms) -> Result<Span, EngineError> {
    let span = validate_span(start, end)?;
    if span.duration_ms() > MAX_QUERY_WINDOW_MS {
        return Err(EngineError::LimitExceeded("query window too wide"));
    }
    Ok(span)
}

impl Engine {
    fn require_engineer(&self, id: Ulid) -> Result<SharedEngineerState, EngineError> {
        self.get_engineer(&id).ok_or(EngineError::UnknownEngineer(id))
    }

    /// Snapshot of the engineer handles, so no map shard stays locked across
    /// an await.
    fn engineer_handles(&self) -> Vec<SharedEngineerState> {
        self.state.iter().map(|e| e.value().clone()).collect()
    }

    pub async fn find_conflicts(
        &self,
        engineer_id: Ulid,
        start: Ms,
        end: Ms,
        exclude: Option<Ulid>,
    ) -> Result<Vec<Assignment>, EngineError> {
        let span = query_window(start, end)?;
        let es = self.require_engineer(engineer_id)?;
        let guard = es.read().await;
        Ok(conflict::find_conflicts(
            guard.overlapping(span),
            engineer_id,
            &span,
            exclude,
        ))
    }

    /// Dry-run the allocation validator without writing anything.
    pub async fn check_allocation(
        &self,
        engineer_id: Ulid,
        start: Ms,
        end: Ms,
        allocation: u32,
        exclude: Option<Ulid>,
    ) -> Result<CapacityCheck, EngineError> {
        let span = validate_span(start, end)?;
        validate_allocation_pct(allocation)?;
        let es = self.require_engineer(engineer_id)?;
        let guard = es.read().await;
        Ok(conflict::check_capacity(
            guard.overlapping(span),
            engineer_id,
            &span,
            allocation,
            guard.max_capacity,
            exclude,
        ))
    }

    pub async fn utilization(
        &self,
        engineer_id: Ulid,
        as_of: Ms,
    ) -> Result<Utilization, EngineError> {
        let es = self.require_engineer(engineer_id)?;
        let guard = es.read().await;
        current_utilization(&guard.assignments, engineer_id, guard.max_capacity, as_of)
    }

    /// Utilization of every engineer at `as_of`, ordered by engineer id.
    pub async fn list_utilization(
        &self,
        as_of: Ms,
    ) -> Result<Vec<(EngineerInfo, Utilization)>, EngineError> {
        let mut rows = Vec::new();
        for es in self.engineer_handles() {
            let guard = es.read().await;
            let u = current_utilization(&guard.assignments, guard.id, guard.max_capacity, as_of)?;
            rows.push((guard.info(), u));
        }
        rows.sort_by_key(|(info, _)| info.id);
        Ok(rows)
    }

    pub async fn allocation_profile(
        &self,
        engineer_id: Ulid,
        start: Ms,
        end: Ms,
    ) -> Result<Vec<AllocationSegment>, EngineError> {
        let window = query_window(start, end)?;
        let es = self.require_engineer(engineer_id)?;
        let guard = es.read().await;
        Ok(utilization::allocation_profile(
            &guard.assignments,
            engineer_id,
            &window,
        ))
    }

    /// Engineers that could take `allocation` percent over `[start, end]`
    /// right now, most headroom first. Headroom is measured the same way the
    /// validator measures it, so every candidate would pass creation.
    pub async fn available_engineers(
        &self,
        start: Ms,
        end: Ms,
        allocation: u32,
    ) -> Result<Vec<Candidate>, EngineError> {
        let span = query_window(start, end)?;
        validate_allocation_pct(allocation)?;

        let mut candidates = Vec::new();
        for es in self.engineer_handles() {
            let guard = es.read().await;
            let taken =
                conflict::overlapping_allocation(guard.overlapping(span), guard.id, &span, None);
            let headroom = guard.max_capacity.saturating_sub(taken);
            if headroom >= allocation {
                candidates.push(Candidate {
                    engineer: guard.info(),
                    headroom,
                });
            }
        }
        candidates.sort_by(|a, b| {
            b.headroom
                .cmp(&a.headroom)
                .then(a.engineer.id.cmp(&b.engineer.id))
        });
        Ok(candidates)
    }

    pub async fn list_engineers(&self) -> Vec<EngineerInfo> {
        let mut out = Vec::with_capacity(self.state.len());
        for es in self.engineer_handles() {
            out.push(es.read().await.info());
        }
        out.sort_by_key(|e| e.id);
        out
    }

    pub async fn get_engineer_info(&self, id: Ulid) -> Result<EngineerInfo, EngineError> {
        let es = self.require_engineer(id)?;
        let info = es.read().await.info();
        Ok(info)
    }

    /// All assignments of an engineer, any status, in start order.
    pub async fn get_assignments(&self, engineer_id: Ulid) -> Result<Vec<Assignment>, EngineError> {
        let es = self.require_engineer(engineer_id)?;
        let guard = es.read().await;
        Ok(guard.assignments.clone())
    }

    pub async fn get_assignment(&self, id: Ulid) -> Result<Assignment, EngineError> {
        let engineer_id = self
            .get_engineer_for_assignment(&id)
            .ok_or(EngineError::NotFound(id))?;
        let es = self.require_engineer(engineer_id)?;
        let guard = es.read().await;
        guard
            .get_assignment(id)
            .cloned()
            .ok_or(EngineError::NotFound(id))
    }
}
