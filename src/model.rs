use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. The only time type.
pub type Ms = i64;

pub const DAY_MS: Ms = 86_400_000;

/// Closed interval `[start, end]` with `start < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    /// Closed on both ends: spans that touch at a single instant overlap.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start <= other.end && self.end >= other.start
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t <= self.end
    }
}

/// Assignment lifecycle. `Completed` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssignmentStatus {
    Planned,
    Active,
    Completed,
    Cancelled,
}

impl AssignmentStatus {
    /// Only planned and active work consumes capacity.
    pub fn counts_toward_capacity(self) -> bool {
        matches!(self, AssignmentStatus::Planned | AssignmentStatus::Active)
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, AssignmentStatus::Completed | AssignmentStatus::Cancelled)
    }

    /// `planned -> active -> completed`, with `cancelled` reachable from any
    /// non-terminal state. Staying put is always allowed.
    pub fn can_transition_to(self, next: AssignmentStatus) -> bool {
        use AssignmentStatus::*;
        self == next
            || matches!(
                (self, next),
                (Planned, Active) | (Active, Completed) | (Planned | Active, Cancelled)
            )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AssignmentStatus::Planned => "planned",
            AssignmentStatus::Active => "active",
            AssignmentStatus::Completed => "completed",
            AssignmentStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for AssignmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AssignmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "planned" => Ok(AssignmentStatus::Planned),
            "active" => Ok(AssignmentStatus::Active),
            "completed" => Ok(AssignmentStatus::Completed),
            "cancelled" | "canceled" => Ok(AssignmentStatus::Cancelled),
            other => Err(format!("unknown assignment status: {other}")),
        }
    }
}

/// One engineer's allocation to one project over a closed date interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub id: Ulid,
    pub engineer_id: Ulid,
    pub project_id: Ulid,
    /// Percent of the engineer's capacity, 1–100.
    pub allocation: u32,
    pub span: Span,
    pub status: AssignmentStatus,
}

/// Input for creating an assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAssignment {
    pub id: Ulid,
    pub engineer_id: Ulid,
    pub project_id: Ulid,
    pub span: Span,
    pub allocation: u32,
    pub status: AssignmentStatus,
}

impl NewAssignment {
    pub fn into_assignment(self) -> Assignment {
        Assignment {
            id: self.id,
            engineer_id: self.engineer_id,
            project_id: self.project_id,
            allocation: self.allocation,
            span: self.span,
            status: self.status,
        }
    }
}

/// Partial update of an assignment. `None` leaves the field unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentPatch {
    pub project_id: Option<Ulid>,
    pub start: Option<Ms>,
    pub end: Option<Ms>,
    pub allocation: Option<u32>,
    pub status: Option<AssignmentStatus>,
}

impl AssignmentPatch {
    pub fn status(status: AssignmentStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.project_id.is_none()
            && self.start.is_none()
            && self.end.is_none()
            && self.allocation.is_none()
            && self.status.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct EngineerState {
    pub id: Ulid,
    pub name: Option<String>,
    /// Max summed allocation percent at any instant (1–100).
    pub max_capacity: u32,
    /// Every assignment of this engineer, sorted by `span.start`.
    pub assignments: Vec<Assignment>,
}

impl EngineerState {
    pub fn new(id: Ulid, name: Option<String>, max_capacity: u32) -> Self {
        Self {
            id,
            name,
            max_capacity,
            assignments: Vec::new(),
        }
    }

    /// Insert assignment maintaining sort order by span.start.
    pub fn insert_assignment(&mut self, assignment: Assignment) {
        let pos = self
            .assignments
            .partition_point(|a| a.span.start <= assignment.span.start);
        self.assignments.insert(pos, assignment);
    }

    pub fn remove_assignment(&mut self, id: Ulid) -> Option<Assignment> {
        let pos = self.assignments.iter().position(|a| a.id == id)?;
        Some(self.assignments.remove(pos))
    }

    pub fn get_assignment(&self, id: Ulid) -> Option<&Assignment> {
        self.assignments.iter().find(|a| a.id == id)
    }

    /// Assignments of any status whose span overlaps the query window.
    /// Binary search skips everything starting after `query.end`.
    pub fn overlapping(&self, query: Span) -> impl Iterator<Item = &Assignment> {
        let right_bound = self
            .assignments
            .partition_point(|a| a.span.start <= query.end);
        self.assignments[..right_bound]
            .iter()
            .filter(move |a| a.span.end >= query.start)
    }

    /// Planned and active assignments only.
    pub fn committed(&self) -> impl Iterator<Item = &Assignment> {
        self.assignments
            .iter()
            .filter(|a| a.status.counts_toward_capacity())
    }

    pub fn info(&self) -> EngineerInfo {
        EngineerInfo {
            id: self.id,
            name: self.name.clone(),
            max_capacity: self.max_capacity,
        }
    }
}

/// Flat event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    EngineerCreated {
        id: Ulid,
        name: Option<String>,
        max_capacity: u32,
    },
    EngineerUpdated {
        id: Ulid,
        name: Option<String>,
        max_capacity: u32,
    },
    EngineerDeleted {
        id: Ulid,
    },
    AssignmentCreated {
        assignment: Assignment,
    },
    /// Carries the full post-update state.
    AssignmentUpdated {
        assignment: Assignment,
    },
    AssignmentRemoved {
        id: Ulid,
        engineer_id: Ulid,
    },
    /// A multi-row insert, logged as one record so it replays whole or not
    /// at all. Rows may belong to different engineers.
    AssignmentBatchCreated {
        assignments: Vec<Assignment>,
    },
}

impl Event {
    /// The engineer whose state this event touches. `None` for batches,
    /// which can touch several.
    pub fn engineer_id(&self) -> Option<Ulid> {
        match self {
            Event::EngineerCreated { id, .. }
            | Event::EngineerUpdated { id, .. }
            | Event::EngineerDeleted { id } => Some(*id),
            Event::AssignmentCreated { assignment } | Event::AssignmentUpdated { assignment } => {
                Some(assignment.engineer_id)
            }
            Event::AssignmentRemoved { engineer_id, .. } => Some(*engineer_id),
            Event::AssignmentBatchCreated { .. } => None,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineerInfo {
    pub id: Ulid,
    pub name: Option<String>,
    pub max_capacity: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Utilization {
    pub total_allocation: u32,
    pub available_capacity: u32,
    /// `total_allocation / max_capacity`; 0.6 means 60% utilized.
    pub utilization_rate: f64,
}

/// Dry-run outcome of the allocation validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapacityCheck {
    pub fits: bool,
    pub current: u32,
    pub requested: u32,
    pub max: u32,
}

/// A maximal run of constant summed allocation. Closed: `start..=end`,
/// so a single-millisecond segment has `start == end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationSegment {
    pub start: Ms,
    pub end: Ms,
    pub allocation: u32,
}

/// An engineer who could absorb a requested allocation over a window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub engineer: EngineerInfo,
    /// Capacity left over the window after the overlapping commitments.
    pub headroom: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assignment(start: Ms, end: Ms) -> Assignment {
        Assignment {
            id: Ulid::new(),
            engineer_id: Ulid::new(),
            project_id: Ulid::new(),
            allocation: 50,
            span: Span::new(start, end),
            status: AssignmentStatus::Active,
        }
    }

    #[test]
    fn span_contains_instant_closed() {
        let s = Span::new(100, 200);
        assert_eq!(s.duration_ms(), 100);
        assert!(s.contains_instant(100));
        assert!(s.contains_instant(200));
        assert!(!s.contains_instant(201));
        assert!(!s.contains_instant(99));
    }

    #[test]
    fn span_touching_overlaps() {
        let a = Span::new(1, 5);
        let b = Span::new(5, 10);
        let c = Span::new(6, 10);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
    }

    #[test]
    fn span_overlap_is_symmetric() {
        let spans = [
            Span::new(0, 10),
            Span::new(5, 15),
            Span::new(10, 20),
            Span::new(11, 12),
            Span::new(-5, 0),
            Span::new(30, 40),
        ];
        for a in &spans {
            for b in &spans {
                assert_eq!(a.overlaps(b), b.overlaps(a), "{a:?} vs {b:?}");
            }
        }
    }

    #[test]
    fn span_contained_overlaps() {
        let outer = Span::new(0, 100);
        let inner = Span::new(40, 60);
        assert!(outer.overlaps(&inner));
        assert!(inner.overlaps(&outer));
    }

    #[test]
    fn status_transitions() {
        use AssignmentStatus::*;
        assert!(Planned.can_transition_to(Active));
        assert!(Active.can_transition_to(Completed));
        assert!(Planned.can_transition_to(Cancelled));
        assert!(Active.can_transition_to(Cancelled));
        assert!(Active.can_transition_to(Active));

        assert!(!Planned.can_transition_to(Completed));
        assert!(!Active.can_transition_to(Planned));
        assert!(!Completed.can_transition_to(Active));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Planned));
    }

    #[test]
    fn status_capacity_participation() {
        assert!(AssignmentStatus::Planned.counts_toward_capacity());
        assert!(AssignmentStatus::Active.counts_toward_capacity());
        assert!(!AssignmentStatus::Completed.counts_toward_capacity());
        assert!(!AssignmentStatus::Cancelled.counts_toward_capacity());
        assert!(AssignmentStatus::Cancelled.is_terminal());
        assert!(!AssignmentStatus::Planned.is_terminal());
    }

    #[test]
    fn status_parse() {
        assert_eq!("Active".parse::<AssignmentStatus>(), Ok(AssignmentStatus::Active));
        assert_eq!("canceled".parse::<AssignmentStatus>(), Ok(AssignmentStatus::Cancelled));
        assert!("paused".parse::<AssignmentStatus>().is_err());
        assert_eq!(AssignmentStatus::Completed.to_string(), "completed");
    }

    #[test]
    fn assignments_kept_sorted() {
        let mut es = EngineerState::new(Ulid::new(), None, 100);
        es.insert_assignment(assignment(300, 400));
        es.insert_assignment(assignment(100, 200));
        es.insert_assignment(assignment(200, 300));
        let starts: Vec<Ms> = es.assignments.iter().map(|a| a.span.start).collect();
        assert_eq!(starts, vec![100, 200, 300]);
    }

    #[test]
    fn remove_missing_assignment_returns_none() {
        let mut es = EngineerState::new(Ulid::new(), None, 100);
        es.insert_assignment(assignment(100, 200));
        assert!(es.remove_assignment(Ulid::new()).is_none());
        assert_eq!(es.assignments.len(), 1);
    }

    #[test]
    fn overlapping_includes_touching_edges() {
        let mut es = EngineerState::new(Ulid::new(), None, 100);
        es.insert_assignment(assignment(0, 100));
        es.insert_assignment(assignment(200, 300));
        es.insert_assignment(assignment(301, 400));

        let hits: Vec<_> = es.overlapping(Span::new(100, 200)).collect();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].span, Span::new(0, 100));
        assert_eq!(hits[1].span, Span::new(200, 300));
    }

    #[test]
    fn overlapping_long_assignment_spanning_query() {
        let mut es = EngineerState::new(Ulid::new(), None, 100);
        es.insert_assignment(assignment(0, 10_000));
        let hits: Vec<_> = es.overlapping(Span::new(500, 600)).collect();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn overlapping_empty_engineer() {
        let es = EngineerState::new(Ulid::new(), None, 100);
        assert_eq!(es.overlapping(Span::new(0, 1000)).count(), 0);
    }

    #[test]
    fn committed_skips_closed_assignments() {
        let mut es = EngineerState::new(Ulid::new(), None, 100);
        let mut done = assignment(0, 100);
        done.status = AssignmentStatus::Completed;
        es.insert_assignment(done);
        es.insert_assignment(assignment(50, 150));
        assert_eq!(es.committed().count(), 1);
    }

    #[test]
    fn event_engineer_id() {
        let a = assignment(0, 10);
        let engineer_id = a.engineer_id;
        assert_eq!(
            Event::AssignmentCreated { assignment: a }.engineer_id(),
            Some(engineer_id)
        );
        let id = Ulid::new();
        assert_eq!(Event::EngineerDeleted { id }.engineer_id(), Some(id));
        assert_eq!(
            Event::AssignmentBatchCreated { assignments: vec![] }.engineer_id(),
            None
        );
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::AssignmentCreated {
            assignment: assignment(0, DAY_MS),
        };
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }

    #[test]
    fn utilization_serializes_to_json() {
        let u = Utilization {
            total_allocation: 60,
            available_capacity: 40,
            utilization_rate: 0.6,
        };
        let json = serde_json::to_value(u).unwrap();
        assert_eq!(json["total_allocation"], 60);
        assert_eq!(json["available_capacity"], 40);
        assert_eq!(json["utilization_rate"], 0.6);
    }
}
