use tracing::info;
use ulid::Ulid;

use crate::model::*;
use crate::notify::Notice;

use super::{Engine, EngineError};

impl Engine {
    pub async fn cancel_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.transition(id, ReservationStatus::Cancelled).await
    }

    pub async fn complete_reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.transition(id, ReservationStatus::Completed).await
    }

    pub async fn mark_no_show(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.transition(id, ReservationStatus::NoShow).await
    }

    /// Move a confirmed reservation to `next`. Anything but `confirmed` is
    /// final. Leaving `confirmed` frees the interval for new bookings.
    pub async fn transition(
        &self,
        id: Ulid,
        next: ReservationStatus,
    ) -> Result<Reservation, EngineError> {
        let current = self
            .reservations
            .reservation(id)
            .await?
            .ok_or(EngineError::NotFound(id))?;
        if !current.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                from: current.status,
                to: next,
            });
        }

        match self
            .reservations
            .update_status(id, current.status, next)
            .await?
        {
            Some(updated) => {
                info!("reservation {id} {} -> {}", current.status, updated.status);
                self.notify
                    .send(updated.business_id, Notice::status_changed(&updated));
                Ok(updated)
            }
            // Lost a race with another transition.
            None => {
                let latest = self
                    .reservations
                    .reservation(id)
                    .await?
                    .ok_or(EngineError::NotFound(id))?;
                Err(EngineError::InvalidTransition {
                    from: latest.status,
                    to: next,
                })
            }
        }
    }

    pub async fn reservation(&self, id: Ulid) -> Result<Reservation, EngineError> {
        self.reservations
            .reservation(id)
            .await?
            .ok_or(EngineError::NotFound(id))
    }

    pub async fn list_reservations(
        &self,
        filter: &ReservationFilter,
    ) -> Result<Vec<Reservation>, EngineError> {
        Ok(self.reservations.list(filter).await?)
    }
}
