//! Storage contracts the engine consumes.
//!
//! The engine never touches storage state directly; everything it reads or
//! writes goes through these two traits. `crate::store::Store` is the
//! WAL-backed implementation shipped with the server.

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;
use ulid::Ulid;

use crate::model::*;
use crate::time::Minutes;

#[derive(Debug, Error)]
pub enum RepoError {
    /// Storage unreachable or a write could not be made durable. Retryable;
    /// nothing was applied.
    #[error("storage failure: {0}")]
    Storage(String),
    /// Rejected before anything was written.
    #[error("invalid {0}")]
    Invalid(String),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
}

/// Result of an atomic check-and-insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(Reservation),
    /// A confirmed reservation (the id given) already blocks the candidate's interval.
    Conflict(Ulid),
}

/// Read-only catalog: businesses, staff, services, schedules, qualifications.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn business(&self, id: Ulid) -> Result<Option<BusinessSettings>, RepoError>;

    async fn service(&self, id: Ulid) -> Result<Option<ServiceSpec>, RepoError>;

    async fn staff_member(&self, id: Ulid) -> Result<Option<StaffMember>, RepoError>;

    async fn working_interval(
        &self,
        staff_id: Ulid,
        weekday: u8,
    ) -> Result<Option<WorkingInterval>, RepoError>;

    async fn qualified_staff(&self, service_id: Ulid) -> Result<Vec<Ulid>, RepoError>;

    async fn is_qualified(&self, staff_id: Ulid, service_id: Ulid) -> Result<bool, RepoError>;

    async fn booking_buffer(&self, business_id: Ulid) -> Result<Minutes, RepoError> {
        Ok(self
            .business(business_id)
            .await?
            .map_or(0, |b| b.buffer_minutes))
    }

    async fn max_advance_days(&self, business_id: Ulid) -> Result<u32, RepoError> {
        Ok(self
            .business(business_id)
            .await?
            .map_or(DEFAULT_MAX_ADVANCE_DAYS, |b| b.max_advance_days))
    }
}

#[async_trait]
pub trait ReservationRepository: Send + Sync {
    /// Confirmed reservations for one staff member and date, ordered by start time.
    async fn confirmed_reservations(
        &self,
        staff_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Reservation>, RepoError>;

    /// Insert `candidate` as confirmed unless it overlaps an existing confirmed
    /// reservation extended by `buffer`. Check and insert are one atomic step
    /// per `(staff_id, date)`.
    async fn try_commit(
        &self,
        candidate: Reservation,
        buffer: Minutes,
    ) -> Result<CommitOutcome, RepoError>;

    async fn reservation(&self, id: Ulid) -> Result<Option<Reservation>, RepoError>;

    /// Compare-and-set on status. `None` if the reservation is gone or its
    /// status is no longer `expected`.
    async fn update_status(
        &self,
        id: Ulid,
        expected: ReservationStatus,
        next: ReservationStatus,
    ) -> Result<Option<Reservation>, RepoError>;

    /// Ordered by date, then start time.
    async fn list(&self, filter: &ReservationFilter) -> Result<Vec<Reservation>, RepoError>;
}
