use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::notify::NotifyHub;
use crate::observability::WAL_COMPACTIONS_TOTAL;
use crate::store::Store;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites the WAL as a snapshot once `threshold`
/// appends have piled up since the last compaction, and drops notification
/// channels nobody listens on any more.
pub async fn run_compactor(store: Arc<Store>, notify: Arc<NotifyHub>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        notify.prune();
        compact_if_due(&store, threshold).await;
    }
}

/// One compaction check. Returns whether the WAL was rewritten.
pub async fn compact_if_due(store: &Store, threshold: u64) -> bool {
    let appends = store.wal_appends_since_compact().await;
    if appends < threshold {
        debug!("compaction not due: {appends}/{threshold} appends");
        return false;
    }
    match store.compact_wal().await {
        Ok(events) => {
            metrics::counter!(WAL_COMPACTIONS_TOTAL).increment(1);
            info!("WAL compacted: {appends} appends folded into {events} events");
            true
        }
        Err(e) => {
            error!("WAL compaction failed: {e}");
            false
        }
    }
}
