use ulid::Ulid;

use crate::model::{AssignmentStatus, Ms};

#[derive(Debug, Clone, PartialEq)]
pub enum EngineError {
    /// Assignment id not found.
    NotFound(Ulid),
    UnknownEngineer(Ulid),
    AlreadyExists(Ulid),
    InvalidInterval {
        start: Ms,
        end: Ms,
    },
    InvalidAllocation(u32),
    InvalidCapacityConfig(u32),
    /// Accepting the request would push the overlapping total above `max`.
    /// `current` excludes the requested amount.
    CapacityExceeded {
        current: u32,
        requested: u32,
        max: u32,
    },
    InvalidTransition {
        from: AssignmentStatus,
        to: AssignmentStatus,
    },
    AssignmentClosed(Ulid),
    HasAssignments(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Caller-input problems, as opposed to capacity or storage failures.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidInterval { .. }
                | EngineError::InvalidAllocation(_)
                | EngineError::InvalidCapacityConfig(_)
                | EngineError::InvalidTransition { .. }
                | EngineError::LimitExceeded(_)
        )
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::NotFound(id) => write!(f, "assignment not found: {id}"),
            EngineError::UnknownEngineer(id) => write!(f, "unknown engineer: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::InvalidInterval { start, end } => {
                write!(f, "invalid interval [{start}, {end}]: end must be after start")
            }
            EngineError::InvalidAllocation(pct) => {
                write!(f, "invalid allocation {pct}%: must be between 1 and 100")
            }
            EngineError::InvalidCapacityConfig(pct) => {
                write!(f, "invalid max capacity {pct}%: must be between 1 and 100")
            }
            EngineError::CapacityExceeded {
                current,
                requested,
                max,
            } => write!(
                f,
                "capacity exceeded: {current}% already allocated + {requested}% requested > {max}% max"
            ),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "invalid status transition: {from} -> {to}")
            }
            EngineError::AssignmentClosed(id) => {
                write!(f, "assignment {id} is completed or cancelled")
            }
            EngineError::HasAssignments(id) => {
                write!(f, "cannot delete engineer {id}: has planned or active assignments")
            }
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
