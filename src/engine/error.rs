use ulid::Ulid;

use crate::model::ReservationState;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("staff member already assigned at that time (assignment {existing}); please pick another time")]
    StaffCollision { existing: Ulid },
    #[error("service area already assigned at that time (assignment {existing}); please pick another time")]
    AreaCollision { existing: Ulid },
    #[error("reservation {id} is {state}; transition not allowed")]
    InvalidState { id: Ulid, state: ReservationState },
    #[error("time already taken by reservation {0}; please pick another time")]
    Conflict(Ulid),
    #[error("external busy feed unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl EngineError {
    /// Stable code reported to API callers.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::StaffCollision { .. } => "staff_collision",
            EngineError::AreaCollision { .. } => "area_collision",
            EngineError::InvalidState { .. } => "invalid_state",
            EngineError::Conflict(_) => "conflict",
            EngineError::UpstreamUnavailable(_) => "upstream_unavailable",
            EngineError::NotFound(_) => "not_found",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::WalError(_) => "storage",
        }
    }

    /// Collisions and lost races: the caller should offer another time.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::StaffCollision { .. } | EngineError::AreaCollision { .. } | EngineError::Conflict(_)
        )
    }
}
