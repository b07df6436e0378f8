use chrono::NaiveDate;
use thiserror::Error;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::Notice;
use crate::observability::BOOKINGS_TOTAL;
use crate::repo::CommitOutcome;
use crate::time::{add_minutes, TimeOfDay};

use super::availability::within_horizon;
use super::{Engine, EngineError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub business_id: Ulid,
    pub staff_id: Ulid,
    pub service_id: Ulid,
    pub date: NaiveDate,
    pub time: TimeOfDay,
    pub customer: CustomerInfo,
}

/// Why a well-formed admission attempt did not commit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectReason {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("staff member is not qualified for this service")]
    NotQualified,
    #[error("slot unavailable")]
    SlotUnavailable,
}

impl RejectReason {
    pub fn label(&self) -> &'static str {
        match self {
            RejectReason::InvalidInput(_) => "invalid_input",
            RejectReason::NotQualified => "not_qualified",
            RejectReason::SlotUnavailable => "slot_unavailable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingOutcome {
    Committed(Reservation),
    Rejected(RejectReason),
}

impl BookingOutcome {
    pub fn reservation(&self) -> Option<&Reservation> {
        match self {
            BookingOutcome::Committed(r) => Some(r),
            BookingOutcome::Rejected(_) => None,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            BookingOutcome::Committed(_) => "committed",
            BookingOutcome::Rejected(reason) => reason.label(),
        }
    }
}

/// Trimmed copy of the customer fields, or why they are unusable.
fn validate_customer(customer: &CustomerInfo) -> Result<CustomerInfo, RejectReason> {
    let name = customer.name.trim();
    let contact = customer.contact.trim();
    if name.is_empty() {
        return Err(RejectReason::InvalidInput("customer name is required".into()));
    }
    if contact.is_empty() {
        return Err(RejectReason::InvalidInput("customer contact is required".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(RejectReason::InvalidInput("customer name too long".into()));
    }
    if contact.len() > MAX_CONTACT_LEN {
        return Err(RejectReason::InvalidInput("customer contact too long".into()));
    }
    let notes = match customer.notes.as_deref().map(str::trim) {
        Some(n) if n.len() > MAX_NOTES_LEN => {
            return Err(RejectReason::InvalidInput("notes too long".into()));
        }
        Some("") | None => None,
        Some(n) => Some(n.to_string()),
    };
    Ok(CustomerInfo {
        name: name.to_string(),
        contact: contact.to_string(),
        notes,
    })
}

impl Engine {
    /// Admit a booking request: validate, re-check availability against
    /// current state, then commit atomically. Two concurrent requests for
    /// overlapping slots of the same staff member and date never both commit.
    ///
    /// Expected outcomes come back as `BookingOutcome`; `Err` means storage
    /// failed and nothing was committed.
    pub async fn request_booking(
        &self,
        request: BookingRequest,
    ) -> Result<BookingOutcome, EngineError> {
        let result = self.admit(request).await;
        let outcome = match &result {
            Ok(outcome) => outcome.label(),
            Err(_) => "error",
        };
        metrics::counter!(BOOKINGS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn admit(&self, request: BookingRequest) -> Result<BookingOutcome, EngineError> {
        // Requested
        let customer = match validate_customer(&request.customer) {
            Ok(c) => c,
            Err(reason) => return Ok(BookingOutcome::Rejected(reason)),
        };
        let Some(ctx) = self
            .booking_context(request.business_id, request.service_id)
            .await?
        else {
            return Ok(BookingOutcome::Rejected(RejectReason::NotQualified));
        };
        if self
            .resolve_staff(&ctx, Some(request.staff_id))
            .await?
            .is_empty()
        {
            return Ok(BookingOutcome::Rejected(RejectReason::NotQualified));
        }

        // Checked: the slot must be open right now, under the admission lock.
        let _admission = self
            .admission_locks
            .acquire(request.staff_id, request.date)
            .await;
        let now = self.now();
        if !within_horizon(request.date, now.date(), ctx.business.max_advance_days) {
            return Ok(BookingOutcome::Rejected(RejectReason::SlotUnavailable));
        }
        let open = self
            .open_times(&ctx, request.staff_id, request.date, now)
            .await?;
        if !open.contains(&request.time) {
            debug!(
                "booking {} {} for staff {} not open",
                request.date, request.time, request.staff_id
            );
            return Ok(BookingOutcome::Rejected(RejectReason::SlotUnavailable));
        }
        let Some(end_time) = add_minutes(request.time, ctx.service.duration_minutes) else {
            return Ok(BookingOutcome::Rejected(RejectReason::SlotUnavailable));
        };

        // Committed or Rejected, decided atomically by the repository.
        let candidate = Reservation {
            id: Ulid::new(),
            business_id: request.business_id,
            staff_id: request.staff_id,
            service_id: request.service_id,
            date: request.date,
            start_time: request.time,
            end_time,
            status: ReservationStatus::Confirmed,
            customer,
            created_at: chrono::Utc::now().timestamp_millis(),
        };
        match self
            .reservations
            .try_commit(candidate, ctx.business.buffer_minutes)
            .await?
        {
            CommitOutcome::Committed(reservation) => {
                info!(
                    "reservation {} committed: staff {} {} {}-{}",
                    reservation.id,
                    reservation.staff_id,
                    reservation.date,
                    reservation.start_time,
                    reservation.end_time
                );
                self.notify
                    .send(reservation.business_id, Notice::confirmed(&reservation));
                Ok(BookingOutcome::Committed(reservation))
            }
            CommitOutcome::Conflict(blocking) => {
                debug!("booking blocked by reservation {blocking}");
                Ok(BookingOutcome::Rejected(RejectReason::SlotUnavailable))
            }
        }
    }
}
