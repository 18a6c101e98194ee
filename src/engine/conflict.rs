use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as Ms)
        .unwrap_or(0)
}

/// Reject `end <= start` before any overlap math, then apply range limits.
pub fn validate_span(start: Ms, end: Ms) -> Result<Span, EngineError> {
    if end <= start {
        return Err(EngineError::InvalidInterval { start, end });
    }
    if start < MIN_VALID_TIMESTAMP_MS || end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    let span = Span::new(start, end);
    if span.duration_ms() > MAX_SPAN_DURATION_MS {
        return Err(EngineError::LimitExceeded("span too wide"));
    }
    Ok(span)
}

pub fn validate_allocation_pct(allocation: u32) -> Result<(), EngineError> {
    if allocation == 0 || allocation > MAX_PERCENT {
        return Err(EngineError::InvalidAllocation(allocation));
    }
    Ok(())
}

pub fn validate_capacity(max_capacity: u32) -> Result<(), EngineError> {
    if max_capacity == 0 || max_capacity > MAX_PERCENT {
        return Err(EngineError::InvalidCapacityConfig(max_capacity));
    }
    Ok(())
}

/// Planned/active assignments of `engineer_id` overlapping `span`, minus
/// `exclude`, ordered by start (ties broken by id).
pub fn find_conflicts<'a>(
    assignments: impl IntoIterator<Item = &'a Assignment>,
    engineer_id: Ulid,
    span: &Span,
    exclude: Option<Ulid>,
) -> Vec<Assignment> {
    let mut conflicts: Vec<Assignment> = assignments
        .into_iter()
        .filter(|a| a.engineer_id == engineer_id)
        .filter(|a| a.status.counts_toward_capacity())
        .filter(|a| Some(a.id) != exclude)
        .filter(|a| a.span.overlaps(span))
        .cloned()
        .collect();
    conflicts.sort_by(|a, b| a.span.start.cmp(&b.span.start).then(a.id.cmp(&b.id)));
    conflicts
}

/// Sum of allocations that overlap `span`, i.e. what a new request stacks on.
pub fn overlapping_allocation<'a>(
    assignments: impl IntoIterator<Item = &'a Assignment>,
    engineer_id: Ulid,
    span: &Span,
    exclude: Option<Ulid>,
) -> u32 {
    assignments
        .into_iter()
        .filter(|a| a.engineer_id == engineer_id)
        .filter(|a| a.status.counts_toward_capacity())
        .filter(|a| Some(a.id) != exclude)
        .filter(|a| a.span.overlaps(span))
        .map(|a| a.allocation)
        .sum()
}

/// Would `proposed` more percent over `span` keep the engineer within
/// `max_capacity`? Exactly reaching the max is allowed.
pub fn validate_allocation<'a>(
    assignments: impl IntoIterator<Item = &'a Assignment>,
    engineer_id: Ulid,
    span: &Span,
    proposed: u32,
    max_capacity: u32,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    if span.end <= span.start {
        return Err(EngineError::InvalidInterval {
            start: span.start,
            end: span.end,
        });
    }
    validate_capacity(max_capacity)?;
    let check = check_capacity(assignments, engineer_id, span, proposed, max_capacity, exclude);
    if check.fits {
        Ok(())
    } else {
        Err(EngineError::CapacityExceeded {
            current: check.current,
            requested: check.requested,
            max: check.max,
        })
    }
}

/// Non-failing form of [`validate_allocation`] for dry runs.
pub fn check_capacity<'a>(
    assignments: impl IntoIterator<Item = &'a Assignment>,
    engineer_id: Ulid,
    span: &Span,
    proposed: u32,
    max_capacity: u32,
    exclude: Option<Ulid>,
) -> CapacityCheck {
    let current = overlapping_allocation(assignments, engineer_id, span, exclude);
    CapacityCheck {
        fits: current.saturating_add(proposed) <= max_capacity,
        current,
        requested: proposed,
        max: max_capacity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const D: Ms = DAY_MS;
    const NONE: &[Assignment] = &[];

    // Day 0 = Jan 1.
    const JAN1: Ms = 0;
    const JAN15: Ms = 14 * D;
    const JAN31: Ms = 30 * D;
    const MAY15: Ms = 134 * D;
    const JUN30: Ms = 180 * D;
    const JUL1: Ms = 181 * D;
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
    fn empty_engineer_accepts() {
        let eng = Ulid::new();
        let result = validate_allocation(NONE, eng, &Span::new(JAN1, JAN31), 60, 100, None);
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn exactly_full_is_allowed() {
        let eng = Ulid::new();
        let x = assignment(eng, JAN1, JUN30, 60, AssignmentStatus::Active);
        let result = validate_allocation(&[x], eng, &Span::new(JAN15, MAY15), 40, 100, None);
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn one_over_is_rejected() {
        let eng = Ulid::new();
        let x = assignment(eng, JAN1, JUN30, 60, AssignmentStatus::Active);
        let result = validate_allocation(&[x], eng, &Span::new(JAN15, MAY15), 41, 100, None);
        assert_eq!(
            result,
            Err(EngineError::CapacityExceeded {
                current: 60,
                requested: 41,
                max: 100
            })
        );
    }

    #[test]
    fn no_conflicts_after_assignment_ends() {
        let eng = Ulid::new();
        let x = assignment(eng, JAN1, JUN30, 60, AssignmentStatus::Active);
        let conflicts = find_conflicts(&[x], eng, &Span::new(JUL1, DEC31), None);
        assert!(conflicts.is_empty());
    }

    #[test]
    fn touching_boundary_conflicts() {
        let eng = Ulid::new();
        let x = assignment(eng, JAN1, JUN30, 60, AssignmentStatus::Planned);
        let conflicts = find_conflicts(&[x.clone()], eng, &Span::new(JUN30, DEC31), None);
        assert_eq!(conflicts, vec![x]);
    }

    #[test]
    fn cancelled_and_completed_ignored() {
        let eng = Ulid::new();
        let y = assignment(eng, JAN1, DEC31, 80, AssignmentStatus::Cancelled);
        let z = assignment(eng, JAN1, DEC31, 80, AssignmentStatus::Completed);
        let all = [y, z];
        assert!(find_conflicts(&all, eng, &Span::new(JAN1, JAN31), None).is_empty());
        assert_eq!(
            validate_allocation(&all, eng, &Span::new(JAN1, JAN31), 100, 100, None),
            Ok(())
        );
    }

    #[test]
    fn other_engineers_ignored() {
        let eng = Ulid::new();
        let other = assignment(Ulid::new(), JAN1, DEC31, 100, AssignmentStatus::Active);
        assert!(find_conflicts(&[other.clone()], eng, &Span::new(JAN1, JAN31), None).is_empty());
        assert_eq!(overlapping_allocation(&[other], eng, &Span::new(JAN1, JAN31), None), 0);
    }

    #[test]
    fn conflicts_sorted_by_start() {
        let eng = Ulid::new();
        let late = assignment(eng, MAY15, JUN30, 10, AssignmentStatus::Planned);
        let early = assignment(eng, JAN1, JAN31, 10, AssignmentStatus::Active);
        let mid = assignment(eng, JAN15, MAY15, 10, AssignmentStatus::Active);
        let found = find_conflicts(&[late, early, mid], eng, &Span::new(JAN1, DEC31), None);
        let starts: Vec<Ms> = found.iter().map(|a| a.span.start).collect();
        assert_eq!(starts, vec![JAN1, JAN15, MAY15]);
    }

    #[test]
    fn excluded_assignment_does_not_conflict_with_itself() {
        let eng = Ulid::new();
        let x = assignment(eng, JAN1, JUN30, 100, AssignmentStatus::Active);
        let span = x.span;
        let id = x.id;
        let all = [x];
        assert!(find_conflicts(&all, eng, &span, Some(id)).is_empty());
        assert_eq!(validate_allocation(&all, eng, &span, 100, 100, Some(id)), Ok(()));
        assert!(validate_allocation(&all, eng, &span, 100, 100, None).is_err());
    }

    #[test]
    fn sums_every_overlapping_assignment() {
        // Pairwise-overlap sum: A and B never coexist, yet both overlap the
        // request, so their allocations stack.
        let eng = Ulid::new();
        let a = assignment(eng, JAN1, JAN15, 50, AssignmentStatus::Active);
        let b = assignment(eng, MAY15, JUN30, 50, AssignmentStatus::Active);
        let check = check_capacity(&[a, b], eng, &Span::new(JAN1, JUN30), 10, 100, None);
        assert!(!check.fits);
        assert_eq!(check.current, 100);
    }

    #[test]
    fn lower_max_capacity_respected() {
        let eng = Ulid::new();
        let x = assignment(eng, JAN1, JUN30, 40, AssignmentStatus::Active);
        let result = validate_allocation(&[x], eng, &Span::new(JAN1, JAN31), 41, 80, None);
        assert_eq!(
            result,
            Err(EngineError::CapacityExceeded {
                current: 40,
                requested: 41,
                max: 80
            })
        );
    }

    #[test]
    fn zero_max_capacity_is_config_error() {
        let eng = Ulid::new();
        let result = validate_allocation(NONE, eng, &Span::new(JAN1, JAN31), 10, 0, None);
        assert_eq!(result, Err(EngineError::InvalidCapacityConfig(0)));
    }

    #[test]
    fn inverted_interval_rejected() {
        let eng = Ulid::new();
        let span = Span { start: JAN31, end: JAN1 };
        let result = validate_allocation(NONE, eng, &span, 10, 100, None);
        assert_eq!(
            result,
            Err(EngineError::InvalidInterval {
                start: JAN31,
                end: JAN1
            })
        );
    }

    #[test]
    fn validate_span_checks() {
        assert_eq!(validate_span(JAN1, JAN31), Ok(Span::new(JAN1, JAN31)));
        assert!(matches!(
            validate_span(JAN31, JAN31),
            Err(EngineError::InvalidInterval { .. })
        ));
        assert!(matches!(
            validate_span(-D, JAN31),
            Err(EngineError::LimitExceeded(_))
        ));
        assert!(matches!(
            validate_span(JAN1, MAX_SPAN_DURATION_MS + 1),
            Err(EngineError::LimitExceeded(_))
        ));
    }

    #[test]
    fn allocation_and_capacity_ranges() {
        assert!(validate_allocation_pct(1).is_ok());
        assert!(validate_allocation_pct(100).is_ok());
        assert_eq!(validate_allocation_pct(0), Err(EngineError::InvalidAllocation(0)));
        assert_eq!(validate_allocation_pct(101), Err(EngineError::InvalidAllocation(101)));
        assert!(validate_capacity(100).is_ok());
        assert_eq!(validate_capacity(0), Err(EngineError::InvalidCapacityConfig(0)));
    }

    #[test]
    fn accepted_sequence_never_exceeds_capacity() {
        // Greedily accept whatever validates; every accepted request must
        // leave the overlapping sum within capacity at acceptance time.
        let eng = Ulid::new();
        let mut accepted: Vec<Assignment> = Vec::new();
        let requests = [
            (0, 10, 30),
            (5, 15, 50),
            (8, 9, 30),
            (12, 20, 40),
            (0, 20, 10),
            (21, 30, 100),
            (25, 26, 1),
        ];
        for (s, e, pct) in requests {
            let span = Span::new(s * D, e * D);
            let ok = validate_allocation(&accepted, eng, &span, pct, 100, None).is_ok();
            if ok {
                let before = overlapping_allocation(&accepted, eng, &span, None);
                assert!(before + pct <= 100);
                accepted.push(assignment(eng, s * D, e * D, pct, AssignmentStatus::Planned));
            }
        }
        assert_eq!(accepted.len(), 4);
    }
}
