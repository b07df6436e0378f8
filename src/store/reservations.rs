use async_trait::async_trait;
use chrono::NaiveDate;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::repo::{CommitOutcome, RepoError, ReservationRepository};
use crate::time::Minutes;

use super::{DayKey, Store};

#[async_trait]
impl ReservationRepository for Store {
    async fn confirmed_reservations(
        &self,
        staff_id: Ulid,
        date: NaiveDate,
    ) -> Result<Vec<Reservation>, RepoError> {
        let Some(book) = self.day_book(DayKey { staff_id, date }) else {
            return Ok(Vec::new());
        };
        let guard = book.read().await;
        Ok(guard.confirmed().cloned().collect())
    }

    async fn try_commit(
        &self,
        candidate: Reservation,
        buffer: Minutes,
    ) -> Result<CommitOutcome, RepoError> {
        if candidate.start_time >= candidate.end_time {
            return Err(RepoError::Invalid(format!(
                "reservation {}-{}: start must be before end",
                candidate.start_time, candidate.end_time
            )));
        }
        let key = DayKey::of(&candidate);
        let _gate = self.gate.read().await;
        let book = self.day_book_or_create(key);
        let mut guard = book.write().await;

        if let Some(existing) = guard.blocking(&candidate.span(), buffer) {
            return Ok(CommitOutcome::Conflict(existing.id));
        }
        if guard.confirmed_count() >= MAX_RESERVATIONS_PER_DAY {
            return Err(RepoError::LimitExceeded("too many reservations for one day"));
        }

        let mut reservation = candidate;
        reservation.status = ReservationStatus::Confirmed;
        // Durable first: a failed append leaves the day book untouched.
        self.wal_append(&Event::ReservationCommitted(reservation.clone()))
            .await?;
        guard.insert(reservation.clone());
        self.reservation_days.insert(reservation.id, key);
        Ok(CommitOutcome::Committed(reservation))
    }

    async fn reservation(&self, id: Ulid) -> Result<Option<Reservation>, RepoError> {
        let Some(key) = self.reservation_days.get(&id).map(|e| *e.value()) else {
            return Ok(None);
        };
        let Some(book) = self.day_book(key) else {
            return Ok(None);
        };
        let guard = book.read().await;
        Ok(guard.get(id).cloned())
    }

    async fn update_status(
        &self,
        id: Ulid,
        expected: ReservationStatus,
        next: ReservationStatus,
    ) -> Result<Option<Reservation>, RepoError> {
        let Some(key) = self.reservation_days.get(&id).map(|e| *e.value()) else {
            return Ok(None);
        };
        let Some(book) = self.day_book(key) else {
            return Ok(None);
        };
        let _gate = self.gate.read().await;
        let mut guard = book.write().await;
        if guard.get(id).is_none_or(|r| r.status != expected) {
            return Ok(None);
        }
        self.wal_append(&Event::ReservationStatusChanged {
            id,
            staff_id: key.staff_id,
            date: key.date,
            status: next,
        })
        .await?;
        Ok(guard.set_status(id, next).cloned())
    }

    async fn list(&self, filter: &ReservationFilter) -> Result<Vec<Reservation>, RepoError> {
        let books: Vec<_> = self
            .days
            .iter()
            .filter(|e| {
                let key = e.key();
                filter.staff_id.is_none_or(|s| key.staff_id == s)
                    && filter.date.is_none_or(|d| key.date == d)
            })
            .map(|e| e.value().clone())
            .collect();

        let mut out = Vec::new();
        for book in books {
            let guard = book.read().await;
            out.extend(guard.reservations.iter().filter(|r| filter.matches(r)).cloned());
        }
        out.sort_by(|a, b| {
            (a.date, a.start_time, a.staff_id).cmp(&(b.date, b.start_time, b.staff_id))
        });
        Ok(out)
    }
}
