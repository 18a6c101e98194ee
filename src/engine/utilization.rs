use ulid::Ulid;

use crate::model::*;

use super::EngineError;

// ── Utilization ───────────────────────────────────────────────────

/// Load carried by `engineer_id` at `as_of`: active assignments whose closed
/// span contains the instant. Planned work does not count until it starts.
pub fn current_utilization(
    assignments: &[Assignment],
    engineer_id: Ulid,
    max_capacity: u32,
    as_of: Ms,
) -> Result<Utilization, EngineError> {
    if max_capacity == 0 {
        return Err(EngineError::InvalidCapacityConfig(max_capacity));
    }
    let total_allocation: u32 = assignments
        .iter()
        .filter(|a| a.engineer_id == engineer_id)
        .filter(|a| a.status == AssignmentStatus::Active)
        .filter(|a| a.span.contains_instant(as_of))
        .map(|a| a.allocation)
        .sum();

    Ok(Utilization {
        total_allocation,
        // Over-allocation from manual edits clamps to zero instead of wrapping.
        available_capacity: max_capacity.saturating_sub(total_allocation),
        utilization_rate: total_allocation as f64 / max_capacity as f64,
    })
}

// ── Allocation profile ───────────────────────────────────────────

/// Sweep-line over planned/active assignments clipped to `window`: returns the
/// maximal runs of constant, non-zero summed allocation in start order.
///
/// Spans are closed, so an assignment `[s, e]` contributes `+pct` at `s` and
/// `-pct` at `e + 1`.
pub fn allocation_profile(
    assignments: &[Assignment],
    engineer_id: Ulid,
    window: &Span,
) -> Vec<AllocationSegment> {
    let mut events: Vec<(Ms, i64)> = Vec::new();
    for a in assignments {
        if a.engineer_id != engineer_id
            || !a.status.counts_toward_capacity()
            || !a.span.overlaps(window)
        {
            continue;
        }
        let start = a.span.start.max(window.start);
        let end = a.span.end.min(window.end);
        events.push((start, a.allocation as i64));
        events.push((end + 1, -(a.allocation as i64)));
    }
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut result: Vec<AllocationSegment> = Vec::new();
    let mut load: i64 = 0;
    let mut i = 0;
    while i < events.len() {
        let time = events[i].0;
        while i < events.len() && events[i].0 == time {
            load += events[i].1;
            i += 1;
        }
        if load <= 0 || i == events.len() {
            continue;
        }
        let seg_end = events[i].0 - 1;
        let allocation = load as u32;
        if let Some(last) = result.last_mut()
            && last.end + 1 == time
            && last.allocation == allocation
        {
            last.end = seg_end;
            continue;
        }
        result.push(AllocationSegment {
            start: time,
            end: seg_end,
            allocation,
        });
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    const D: Ms = DAY_MS;
    const JAN1: Ms = 0;
    const MAR1: Ms = 59 * D;
    const JUN30: Ms = 180 * D;
    const DEC31: Ms = 364 * D;

    fn assignment(
        engineer_id: Ulid,
        start: Ms,
        end: Ms,
        allocation: u32,
        status: AssignmentStatus,
    ) -> Assignment {
        Assignment {
            id: Ulid::new(),
            engineer_id,
            project_id: Ulid::new(),
            allocation,
            span: Span::new(start, end),
            status,
        }
    }

    #[test]
    fn utilization_of_single_active_assignment() {
        let eng = Ulid::new();
        let x = assignment(eng, JAN1, JUN30, 60, AssignmentStatus::Active);
        let u = current_utilization(&[x], eng, 100, MAR1).unwrap();
        assert_eq!(u.total_allocation, 60);
        assert_eq!(u.available_capacity, 40);
        assert!((u.utilization_rate - 0.6).abs() < f64::EPSILON);
    }

    #[test]
    fn utilization_ignores_cancelled_and_planned() {
        let eng = Ulid::new();
        let y = assignment(eng, JAN1, DEC31, 80, AssignmentStatus::Cancelled);
        let p = assignment(eng, JAN1, DEC31, 30, AssignmentStatus::Planned);
        let u = current_utilization(&[y, p], eng, 100, MAR1).unwrap();
        assert_eq!(u.total_allocation, 0);
        assert_eq!(u.available_capacity, 100);
        assert_eq!(u.utilization_rate, 0.0);
    }

    #[test]
    fn utilization_closed_boundaries() {
        let eng = Ulid::new();
        let x = assignment(eng, JAN1, JUN30, 60, AssignmentStatus::Active);
        let all = [x];
        assert_eq!(current_utilization(&all, eng, 100, JAN1).unwrap().total_allocation, 60);
        assert_eq!(current_utilization(&all, eng, 100, JUN30).unwrap().total_allocation, 60);
        assert_eq!(current_utilization(&all, eng, 100, JUN30 + 1).unwrap().total_allocation, 0);
    }

    #[test]
    fn utilization_over_allocated_clamps_available() {
        let eng = Ulid::new();
        let a = assignment(eng, JAN1, JUN30, 70, AssignmentStatus::Active);
        let b = assignment(eng, JAN1, JUN30, 50, AssignmentStatus::Active);
        let u = current_utilization(&[a, b], eng, 100, MAR1).unwrap();
        assert_eq!(u.total_allocation, 120);
        assert_eq!(u.available_capacity, 0);
        assert!((u.utilization_rate - 1.2).abs() < 1e-9);
    }

    #[test]
    fn utilization_zero_capacity_is_config_error() {
        let eng = Ulid::new();
        assert_eq!(
            current_utilization(&[], eng, 0, MAR1),
            Err(EngineError::InvalidCapacityConfig(0))
        );
    }

    #[test]
    fn utilization_is_idempotent() {
        let eng = Ulid::new();
        let all = [
            assignment(eng, JAN1, JUN30, 60, AssignmentStatus::Active),
            assignment(eng, MAR1, DEC31, 20, AssignmentStatus::Active),
        ];
        let first = current_utilization(&all, eng, 100, MAR1).unwrap();
        let second = current_utilization(&all, eng, 100, MAR1).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.total_allocation, 80);
    }

    #[test]
    fn profile_empty() {
        let eng = Ulid::new();
        assert!(allocation_profile(&[], eng, &Span::new(0, 100)).is_empty());
    }

    #[test]
    fn profile_stacks_overlaps() {
        let eng = Ulid::new();
        let all = [
            assignment(eng, 0, 99, 50, AssignmentStatus::Active),
            assignment(eng, 50, 149, 30, AssignmentStatus::Planned),
        ];
        let profile = allocation_profile(&all, eng, &Span::new(0, 1000));
        assert_eq!(
            profile,
            vec![
                AllocationSegment { start: 0, end: 49, allocation: 50 },
                AllocationSegment { start: 50, end: 99, allocation: 80 },
                AllocationSegment { start: 100, end: 149, allocation: 30 },
            ]
        );
    }

    #[test]
    fn profile_touching_edges_share_an_instant() {
        let eng = Ulid::new();
        let all = [
            assignment(eng, 0, 100, 50, AssignmentStatus::Active),
            assignment(eng, 100, 200, 50, AssignmentStatus::Active),
        ];
        let profile = allocation_profile(&all, eng, &Span::new(0, 200));
        assert_eq!(
            profile,
            vec![
                AllocationSegment { start: 0, end: 99, allocation: 50 },
                AllocationSegment { start: 100, end: 100, allocation: 100 },
                AllocationSegment { start: 101, end: 200, allocation: 50 },
            ]
        );
    }

    #[test]
    fn profile_merges_back_to_back_equal_loads() {
        let eng = Ulid::new();
        let all = [
            assignment(eng, 0, 99, 40, AssignmentStatus::Active),
            assignment(eng, 100, 199, 40, AssignmentStatus::Active),
        ];
        let profile = allocation_profile(&all, eng, &Span::new(0, 500));
        assert_eq!(profile, vec![AllocationSegment { start: 0, end: 199, allocation: 40 }]);
    }

    #[test]
    fn profile_gap_is_omitted() {
        let eng = Ulid::new();
        let all = [
            assignment(eng, 0, 10, 40, AssignmentStatus::Active),
            assignment(eng, 20, 30, 60, AssignmentStatus::Active),
        ];
        let profile = allocation_profile(&all, eng, &Span::new(0, 100));
        assert_eq!(
            profile,
            vec![
                AllocationSegment { start: 0, end: 10, allocation: 40 },
                AllocationSegment { start: 20, end: 30, allocation: 60 },
            ]
        );
    }

    #[test]
    fn profile_clipped_to_window() {
        let eng = Ulid::new();
        let all = [assignment(eng, 0, 1000, 25, AssignmentStatus::Active)];
        let profile = allocation_profile(&all, eng, &Span::new(100, 200));
        assert_eq!(profile, vec![AllocationSegment { start: 100, end: 200, allocation: 25 }]);
    }

    #[test]
    fn profile_ignores_closed_work() {
        let eng = Ulid::new();
        let all = [
            assignment(eng, 0, 100, 90, AssignmentStatus::Completed),
            assignment(eng, 0, 100, 90, AssignmentStatus::Cancelled),
        ];
        assert!(allocation_profile(&all, eng, &Span::new(0, 100)).is_empty());
    }
}
