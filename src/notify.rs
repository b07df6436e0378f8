use chrono::NaiveDate;
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Reservation, ReservationStatus};
use crate::time::TimeOfDay;

const CHANNEL_CAPACITY: usize = 256;

/// Something a business's listeners should hear about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    ReservationConfirmed {
        reservation_id: Ulid,
        staff_id: Ulid,
        date: NaiveDate,
        start_time: TimeOfDay,
        end_time: TimeOfDay,
    },
    ReservationStatusChanged {
        reservation_id: Ulid,
        staff_id: Ulid,
        date: NaiveDate,
        status: ReservationStatus,
    },
}

impl Notice {
    pub fn confirmed(r: &Reservation) -> Self {
        Notice::ReservationConfirmed {
            reservation_id: r.id,
            staff_id: r.staff_id,
            date: r.date,
            start_time: r.start_time,
            end_time: r.end_time,
        }
    }

    pub fn status_changed(r: &Reservation) -> Self {
        Notice::ReservationStatusChanged {
            reservation_id: r.id,
            staff_id: r.staff_id,
            date: r.date,
            status: r.status,
        }
    }

    /// JSON body delivered as the NOTIFY payload.
    pub fn payload(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Broadcast hub for LISTEN/NOTIFY, one channel per business.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notice>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a business's notices. Creates the channel if needed.
    pub fn subscribe(&self, business_id: Ulid) -> broadcast::Receiver<Notice> {
        let sender = self
            .channels
            .entry(business_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, business_id: Ulid, notice: Notice) {
        if let Some(sender) = self.channels.get(&business_id) {
            let _ = sender.send(notice);
        }
    }

    /// Drop channels whose listeners have all gone away.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}
