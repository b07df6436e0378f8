use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::{Reservation, ReservationStatus};
use crate::time::{MinuteSpan, Minutes};

/// Shard key: one staff member on one calendar date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DayKey {
    pub staff_id: Ulid,
    pub date: NaiveDate,
}

impl DayKey {
    pub fn of(r: &Reservation) -> Self {
        Self {
            staff_id: r.staff_id,
            date: r.date,
        }
    }
}

/// Every reservation of one staff member on one date, any status, sorted by start time.
#[derive(Debug, Clone)]
pub struct DayBook {
    pub key: DayKey,
    pub reservations: Vec<Reservation>,
}

impl DayBook {
    pub fn new(key: DayKey) -> Self {
        Self {
            key,
            reservations: Vec::new(),
        }
    }

    /// Insert keeping start-time order; equal starts keep insertion order.
    pub fn insert(&mut self, reservation: Reservation) {
        let pos = self
            .reservations
            .partition_point(|r| r.start_time <= reservation.start_time);
        self.reservations.insert(pos, reservation);
    }

    pub fn get(&self, id: Ulid) -> Option<&Reservation> {
        self.reservations.iter().find(|r| r.id == id)
    }

    pub fn set_status(&mut self, id: Ulid, status: ReservationStatus) -> Option<&Reservation> {
        let r = self.reservations.iter_mut().find(|r| r.id == id)?;
        r.status = status;
        Some(r)
    }

    pub fn confirmed(&self) -> impl Iterator<Item = &Reservation> {
        self.reservations.iter().filter(|r| r.is_confirmed())
    }

    pub fn confirmed_count(&self) -> usize {
        self.confirmed().count()
    }

    /// First confirmed reservation whose `[start, end + buffer)` overlaps `span`.
    ///
    /// Reservations starting at or after `span.end` cannot overlap, so the scan
    /// stops at that partition point.
    pub fn blocking(&self, span: &MinuteSpan, buffer: Minutes) -> Option<&Reservation> {
        let right_bound = self
            .reservations
            .partition_point(|r| r.start_time.minutes() < span.end);
        self.reservations[..right_bound]
            .iter()
            .filter(|r| r.is_confirmed())
            .find(|r| r.span().extend_end(buffer).overlaps(span))
    }
}
