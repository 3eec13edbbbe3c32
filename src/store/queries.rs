use tokio::sync::oneshot;
use ulid::Ulid;

use crate::model::*;

use super::{ReservationTable, SharedSlot, WalCommand};

impl ReservationTable {
    /// Matching reservations ordered by (date, lab, time), booking order within a slot.
    pub async fn select(&self, filter: &ReservationFilter) -> Vec<Reservation> {
        // Clone the shard handles out first; no DashMap guard may live across an await.
        let mut shards: Vec<SharedSlot> = self
            .slots
            .iter()
            .filter(|e| filter.admits_slot(e.key()))
            .map(|e| e.value().clone())
            .collect();
        let mut keyed = Vec::with_capacity(shards.len());
        for shard in shards.drain(..) {
            let guard = shard.read().await;
            let rows: Vec<Reservation> = guard
                .reservations
                .iter()
                .filter(|r| filter.matches(r))
                .cloned()
                .collect();
            if !rows.is_empty() {
                keyed.push((guard.key.clone(), rows));
            }
        }
        keyed.sort_by(|a, b| a.0.cmp(&b.0));
        keyed.into_iter().flat_map(|(_, rows)| rows).collect()
    }

    pub async fn get(&self, id: Ulid) -> Option<Reservation> {
        let key = self.by_id.get(&id).map(|e| e.value().clone())?;
        let shard = self.slots.get(&key).map(|e| e.value().clone())?;
        let guard = shard.read().await;
        guard.reservations.iter().find(|r| r.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub async fn appends_since_compact(&self) -> u64 {
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
