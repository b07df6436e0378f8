mod admission;
mod availability;
mod conflict;
mod error;
mod slots;
mod status;
#[cfg(test)]
mod tests;

pub use admission::{BookingOutcome, BookingRequest, RejectReason};
pub use availability::within_horizon;
pub use conflict::{filter_conflicts, is_blocked};
pub use error::EngineError;
pub use slots::generate_slots;

use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use ulid::Ulid;

use crate::notify::NotifyHub;
use crate::repo::{Catalog, ReservationRepository};
use crate::store::Store;

/// Source of the business-local "now". Injected so availability stays
/// deterministic under test.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

/// A clock stuck at one instant.
pub struct FixedClock(pub NaiveDateTime);

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        self.0
    }
}

type AdmissionKey = (Ulid, NaiveDate);

/// Per-`(staff_id, date)` critical sections for admission. Entries are dropped
/// again once nobody holds or waits on them.
#[derive(Default)]
struct AdmissionLocks {
    held: DashMap<AdmissionKey, Arc<Mutex<()>>>,
}

struct AdmissionGuard<'a> {
    locks: &'a AdmissionLocks,
    key: AdmissionKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl AdmissionLocks {
    async fn acquire(&self, staff_id: Ulid, date: NaiveDate) -> AdmissionGuard<'_> {
        let key = (staff_id, date);
        let mutex = self.held.entry(key).or_default().value().clone();
        let guard = mutex.lock_owned().await;
        AdmissionGuard {
            locks: self,
            key,
            guard: Some(guard),
        }
    }
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        self.locks
            .held
            .remove_if(&self.key, |_, m| Arc::strong_count(m) == 1);
    }
}

/// The availability and admission core. Holds no booking state of its own;
/// everything goes through the repositories.
pub struct Engine {
    catalog: Arc<dyn Catalog>,
    reservations: Arc<dyn ReservationRepository>,
    notify: Arc<NotifyHub>,
    clock: Arc<dyn Clock>,
    admission_locks: AdmissionLocks,
}

impl Engine {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        reservations: Arc<dyn ReservationRepository>,
        notify: Arc<NotifyHub>,
    ) -> Self {
        Self {
            catalog,
            reservations,
            notify,
            clock: Arc::new(SystemClock),
            admission_locks: AdmissionLocks::default(),
        }
    }

    /// Engine over a single store serving as both repositories.
    pub fn with_store(store: Arc<Store>, notify: Arc<NotifyHub>) -> Self {
        Self::new(store.clone(), store, notify)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn notify(&self) -> &Arc<NotifyHub> {
        &self.notify
    }

    fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }
}
