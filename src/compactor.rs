use std::time::Duration;

use tracing::{debug, info, warn};

use crate::observability::COMPACTIONS_TOTAL;
use crate::store::LocalStore;

/// Background task that periodically compacts the WAL once enough appends
/// have piled up since the last rewrite.
pub async fn run_compactor(store: LocalStore, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        compact_if_needed(&store, threshold).await;
    }
}

/// Compact if at least `threshold` appends happened since the last
/// compaction. Returns whether a compaction ran and succeeded.
pub async fn compact_if_needed(store: &LocalStore, threshold: u64) -> bool {
    let appends = store.wal_appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match store.compact().await {
        Ok(live) => {
            metrics::counter!(COMPACTIONS_TOTAL, "status" => "ok").increment(1);
            info!("compacted WAL: {appends} appends down to {live} records");
            true
        }
        Err(e) => {
            metrics::counter!(COMPACTIONS_TOTAL, "status" => "error").increment(1);
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

/// Compact unconditionally, e.g. at shutdown.
pub async fn compact_now(store: &LocalStore) {
    match store.compact().await {
        Ok(live) => debug!("final compaction: {live} records"),
        Err(e) => warn!("final compaction failed: {e}"),
    }
}
