use tokio::sync::oneshot;

use crate::model::*;
use crate::repo::RepoError;

use super::{Store, WalCommand};

impl Store {
    /// Events that recreate the current state from scratch, catalog first.
    async fn snapshot(&self) -> Vec<Event> {
        let mut events: Vec<Event> = Vec::new();
        events.extend(self.businesses.iter().map(|e| Event::BusinessSaved(e.value().clone())));
        events.extend(self.staff.iter().map(|e| Event::StaffSaved(e.value().clone())));
        events.extend(self.services.iter().map(|e| Event::ServiceSaved(e.value().clone())));
        events.extend(
            self.schedules
                .iter()
                .map(|e| Event::WorkingIntervalSaved(e.value().clone())),
        );
        for entry in self.qualifications.iter() {
            let service_id = *entry.key();
            events.extend(entry.value().iter().map(|&staff_id| Event::QualificationGranted {
                staff_id,
                service_id,
            }));
        }

        let books: Vec<_> = self.days.iter().map(|e| e.value().clone()).collect();
        for book in books {
            let guard = book.read().await;
            events.extend(guard.reservations.iter().cloned().map(Event::ReservationCommitted));
        }
        events
    }

    /// Rewrite the WAL as a snapshot of current state. Mutations wait while
    /// the snapshot is taken and swapped in.
    pub async fn compact_wal(&self) -> Result<usize, RepoError> {
        let _exclusive = self.gate.write().await;
        let events = self.snapshot().await;
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                events,
                response: tx,
            })
            .await
            .map_err(|_| RepoError::Storage("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| RepoError::Storage("WAL writer dropped response".into()))?
            .map_err(|e| RepoError::Storage(e.to_string()))?;
        Ok(count)
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
