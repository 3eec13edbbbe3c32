use tokio::sync::oneshot;
use tokio::task::JoinError;
use tracing::info;
use ulid::Ulid;

use crate::model::*;

use super::{ReservationTable, StoreError, WalCommand};

impl ReservationTable {
    pub async fn insert_reservation(&self, new: NewReservation) -> Result<Reservation, StoreError> {
        let shared = self.compaction.clone().read_owned().await;
        let guard = self.shard(new.slot.clone()).write_owned().await;

        if guard.reservations.iter().any(|r| r.is_held_by(&new.student_id)) {
            return Err(StoreError::UniqueViolation);
        }
        self.claim_row()?;

        let reservation = Reservation::from_new(Ulid::new(), new);
        let event = Event::ReservationCreated(reservation.clone());
        self.spawn_commit(guard, shared, event).await.map_err(commit_failed)??;
        Ok(reservation)
    }

    pub async fn delete_reservation(&self, id: Ulid) -> Result<Reservation, StoreError> {
        let key = self
            .by_id
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(StoreError::Missing(id))?;
        let shared = self.compaction.clone().read_owned().await;
        let guard = self.shard(key.clone()).write_owned().await;

        // A concurrent delete may have won between the index lookup and the lock.
        let removed = guard
            .reservations
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or(StoreError::Missing(id))?;

        let event = Event::ReservationCancelled { id, slot: key };
        self.spawn_commit(guard, shared, event).await.map_err(commit_failed)??;
        Ok(removed)
    }

    /// Rewrite the WAL as one creation event per live reservation.
    pub async fn compact(&self) -> Result<usize, StoreError> {
        let _exclusive = self.compaction.write().await;
        let events: Vec<Event> = self
            .select(&ReservationFilter::default())
            .await
            .into_iter()
            .map(Event::ReservationCreated)
            .collect();
        let live = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Rewrite { events, response: tx })
            .await
            .map_err(|_| StoreError::Other("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::Other("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::Other(format!("WAL compaction failed: {e}")))?;
        info!("compacted WAL to {live} reservations");
        Ok(live)
    }
}

fn commit_failed(e: JoinError) -> StoreError {
    StoreError::Other(format!("commit task failed: {e}"))
}
