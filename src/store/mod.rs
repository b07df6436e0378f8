mod catalog;
mod compact;
mod daybook;
mod reservations;

pub use daybook::{DayBook, DayKey};

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::repo::RepoError;
use crate::wal::Wal;

pub type SharedDayBook = Arc<RwLock<DayBook>>;

type Ack = oneshot::Sender<io::Result<()>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append { event: Event, response: Ack },
    Compact { events: Vec<Event>, response: Ack },
    AppendsSinceCompact { response: oneshot::Sender<u64> },
}

/// Owns the WAL. Each wake-up drains every append already queued and makes
/// the whole batch durable with a single fsync before acknowledging any of it.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    let mut batch: Vec<(Event, Ack)> = Vec::new();
    while let Some(cmd) = rx.recv().await {
        let mut pending = Some(cmd);
        while let Some(cmd) = pending.take() {
            match cmd {
                WalCommand::Append { event, response } => {
                    batch.push((event, response));
                    pending = rx.try_recv().ok();
                }
                other => {
                    commit_batch(&mut wal, &mut batch);
                    handle_control(&mut wal, other);
                    pending = rx.try_recv().ok();
                }
            }
        }
        commit_batch(&mut wal, &mut batch);
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, Ack)>) {
    if batch.is_empty() {
        return;
    }
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if result.is_err() {
        // Every caller hears failure, so none of the batch may survive on disk.
        if let Err(e) = wal.rollback() {
            tracing::error!("WAL rollback failed, retrying before next append: {e}");
        }
    }

    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!("WAL flush of {} events failed: {e}", batch.len());
    }
    for (_, ack) in batch.drain(..) {
        let _ = ack.send(match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        });
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// In-process catalog and reservation storage, durable through the WAL.
///
/// Reservations are sharded into one [`DayBook`] per `(staff_id, date)`, each
/// behind its own `RwLock`; commits for different staff members or dates never
/// contend. Every mutation holds `gate` shared so compaction can take a
/// consistent snapshot by holding it exclusively.
pub struct Store {
    businesses: DashMap<Ulid, BusinessSettings>,
    staff: DashMap<Ulid, StaffMember>,
    services: DashMap<Ulid, ServiceSpec>,
    schedules: DashMap<(Ulid, u8), WorkingInterval>,
    /// service id → qualified staff ids
    qualifications: DashMap<Ulid, HashSet<Ulid>>,
    days: DashMap<DayKey, SharedDayBook>,
    /// reservation id → day book holding it
    reservation_days: DashMap<Ulid, DayKey>,
    /// Serialises catalog writes so WAL order matches apply order.
    catalog_lock: tokio::sync::Mutex<()>,
    gate: RwLock<()>,
    wal_tx: mpsc::Sender<WalCommand>,
}

impl Store {
    /// Replay the WAL at `wal_path` and start its writer task. Must run inside
    /// a tokio runtime.
    pub fn open(wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = Self {
            businesses: DashMap::new(),
            staff: DashMap::new(),
            services: DashMap::new(),
            schedules: DashMap::new(),
            qualifications: DashMap::new(),
            days: DashMap::new(),
            reservation_days: DashMap::new(),
            catalog_lock: tokio::sync::Mutex::new(()),
            gate: RwLock::new(()),
            wal_tx,
        };
        let replayed = events.len();
        store.replay(events);
        tracing::info!(
            "store opened: {replayed} events replayed, {} businesses, {} reservations",
            store.businesses.len(),
            store.reservation_days.len()
        );
        Ok(store)
    }

    /// Day books are assembled unshared, then published once replay is done.
    fn replay(&self, events: Vec<Event>) {
        let mut days: HashMap<DayKey, DayBook> = HashMap::new();
        for event in events {
            match event {
                Event::ReservationCommitted(r) => {
                    let key = DayKey::of(&r);
                    let book = days.entry(key).or_insert_with(|| DayBook::new(key));
                    // Buffers may have changed since commit; a raw overlap never
                    // comes from a legitimate commit.
                    if r.is_confirmed() {
                        if let Some(existing) = book.blocking(&r.span(), 0) {
                            tracing::error!(
                                "WAL replay: reservation {} overlaps {} for staff {} on {}, skipped",
                                r.id,
                                existing.id,
                                key.staff_id,
                                key.date
                            );
                            continue;
                        }
                    }
                    self.reservation_days.insert(r.id, key);
                    book.insert(r);
                }
                Event::ReservationStatusChanged {
                    id,
                    staff_id,
                    date,
                    status,
                } => {
                    if let Some(book) = days.get_mut(&DayKey { staff_id, date }) {
                        book.set_status(id, status);
                    }
                }
                catalog_event => self.apply_catalog(&catalog_event),
            }
        }
        for (key, book) in days {
            self.days.insert(key, Arc::new(RwLock::new(book)));
        }
    }

    /// Apply a catalog event to the in-memory indexes. Reservation events are
    /// applied under their day book's lock instead.
    fn apply_catalog(&self, event: &Event) {
        match event {
            Event::BusinessSaved(b) => {
                self.businesses.insert(b.id, b.clone());
            }
            Event::StaffSaved(s) => {
                self.staff.insert(s.id, s.clone());
            }
            Event::ServiceSaved(s) => {
                self.services.insert(s.id, s.clone());
            }
            Event::WorkingIntervalSaved(wi) => {
                self.schedules.insert((wi.staff_id, wi.weekday), wi.clone());
            }
            Event::QualificationGranted {
                staff_id,
                service_id,
            } => {
                self.qualifications
                    .entry(*service_id)
                    .or_default()
                    .insert(*staff_id);
            }
            Event::QualificationRevoked {
                staff_id,
                service_id,
            } => {
                if let Some(mut staff) = self.qualifications.get_mut(service_id) {
                    staff.remove(staff_id);
                }
            }
            Event::ReservationCommitted(_) | Event::ReservationStatusChanged { .. } => {}
        }
    }

    /// Hand an event to the group-commit writer and wait until it is durable.
    async fn wal_append(&self, event: &Event) -> Result<(), RepoError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| RepoError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| RepoError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| RepoError::Storage(e.to_string()))
    }

    /// Persist then apply a catalog event, serialised with other catalog writes.
    async fn persist_catalog(&self, event: Event) -> Result<(), RepoError> {
        let _gate = self.gate.read().await;
        let _serial = self.catalog_lock.lock().await;
        self.wal_append(&event).await?;
        self.apply_catalog(&event);
        Ok(())
    }

    pub(super) fn day_book(&self, key: DayKey) -> Option<SharedDayBook> {
        self.days.get(&key).map(|e| e.value().clone())
    }

    pub(super) fn day_book_or_create(&self, key: DayKey) -> SharedDayBook {
        self.days
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(DayBook::new(key))))
            .value()
            .clone()
    }
}
