use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::store::ReservationTable;

const CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that rewrites the WAL once enough appends have piled up.
pub async fn run_compactor(table: Arc<ReservationTable>, threshold: u64) {
    let mut interval = tokio::time::interval(CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&table, threshold).await;
    }
}

/// One compactor pass. Returns whether a rewrite happened.
pub async fn compact_if_due(table: &ReservationTable, threshold: u64) -> bool {
    let appends = table.appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match table.compact().await {
        Ok(live) => {
            debug!("compacted after {appends} appends, {live} live reservations");
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}
