use thiserror::Error;
use ulid::Ulid;

use crate::model::ReservationStatus;
use crate::repo::RepoError;

/// Failures of the engine itself. Expected booking outcomes (slot taken,
/// bad customer input) are `RejectReason`s, not errors.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Repository(#[from] RepoError),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("cannot move reservation from {from} to {to}")]
    InvalidTransition {
        from: ReservationStatus,
        to: ReservationStatus,
    },
}

impl EngineError {
    /// Storage trouble the caller may retry as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Repository(RepoError::Storage(_)))
    }
}
