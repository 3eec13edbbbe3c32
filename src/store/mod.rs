mod error;
mod mutations;
mod queries;
#[cfg(test)]
mod tests;

pub use error::StoreError;

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::task::JoinHandle;
use tracing::info;
use ulid::Ulid;

use crate::catalog::SlotKey;
use crate::limits::MAX_RESERVATIONS;
use crate::model::*;
use crate::notify::{NotifyHub, Subscription};
use crate::wal::Wal;

/// The contract the consistency engine needs from a backing store.
#[async_trait]
pub trait ReservationStore: Send + Sync {
    /// Reservations matching `filter`, ordered by slot and then by booking order.
    async fn query(&self, filter: &ReservationFilter) -> Result<Vec<Reservation>, StoreError>;

    /// Insert with the uniqueness constraint enforced atomically.
    async fn insert(&self, new: NewReservation) -> Result<Reservation, StoreError>;

    /// Remove by id, returning what was removed.
    async fn delete_by_id(&self, id: Ulid) -> Result<Reservation, StoreError>;

    /// Feed of every insert and delete from now on.
    fn subscribe(&self) -> Subscription;
}

/// Reservations of one slot, in booking order.
#[derive(Debug)]
pub struct SlotState {
    pub key: SlotKey,
    pub reservations: Vec<Reservation>,
}

impl SlotState {
    fn new(key: SlotKey) -> Self {
        Self {
            key,
            reservations: Vec::new(),
        }
    }

    fn apply(&mut self, event: &Event) {
        match event {
            Event::ReservationCreated(r) => self.reservations.push(r.clone()),
            Event::ReservationCancelled { id, .. } => self.reservations.retain(|r| r.id != *id),
        }
    }
}

pub type SharedSlot = Arc<RwLock<SlotState>>;

// ── Group-commit WAL channel ─────────────────────────────

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Rewrite {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Pending = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the WAL. Appends that queue up while a flush is in progress are
/// written together and share one fsync.
async fn wal_writer_loop(mut wal: Wal<Event>, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        for (_, tx) in batch {
            let r = match &result {
                Ok(()) => Ok(()),
                Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
            };
            let _ = tx.send(r);
        }

        if let Some(cmd) = deferred {
            handle_non_append(&mut wal, cmd);
        }
    }
}

/// All or nothing: a failed batch is cut from the file, and every waiter gets the error.
fn flush_batch(wal: &mut Wal<Event>, batch: &[Pending]) -> io::Result<()> {
    wal.append_batch(batch.iter().map(|(event, _)| event))
}

fn handle_non_append(wal: &mut Wal<Event>, cmd: WalCommand) {
    match cmd {
        WalCommand::Rewrite { events, response } => {
            let _ = response.send(wal.rewrite(&events));
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

/// The bundled backing store: sharded in-memory table, WAL-backed.
pub struct ReservationTable {
    slots: DashMap<SlotKey, SharedSlot>,
    /// Reservation id → owning slot.
    by_id: Arc<DashMap<Ulid, SlotKey>>,
    /// Live rows plus inserts still being committed. Never exceeds `limit`.
    occupied: Arc<AtomicUsize>,
    limit: usize,
    wal_tx: mpsc::Sender<WalCommand>,
    notify: Arc<NotifyHub>,
    /// Mutations hold it shared across log-then-apply; compaction holds it exclusively.
    compaction: Arc<RwLock<()>>,
}

impl ReservationTable {
    /// Replay the log at `wal_path` and start the writer. Needs a Tokio runtime.
    pub fn open(wal_path: &Path, notify: Arc<NotifyHub>) -> io::Result<Self> {
        Self::open_with_limit(wal_path, notify, MAX_RESERVATIONS)
    }

    /// `open` with a custom bound on live reservations.
    pub fn open_with_limit(wal_path: &Path, notify: Arc<NotifyHub>, limit: usize) -> io::Result<Self> {
        let events = Wal::<Event>::replay(wal_path)?;
        let wal = Wal::open(wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let table = Self {
            slots: DashMap::new(),
            by_id: Arc::new(DashMap::new()),
            occupied: Arc::new(AtomicUsize::new(0)),
            limit,
            wal_tx,
            notify,
            compaction: Arc::new(RwLock::new(())),
        };

        // Sole owner of every slot lock here, so try_write never contends.
        for event in &events {
            let slot = table.shard(event.slot());
            let mut guard = slot
                .try_write()
                .map_err(|_| io::Error::other("replay: slot lock contended"))?;
            index(&table.by_id, event);
            guard.apply(event);
        }
        table.occupied.store(table.by_id.len(), Ordering::Release);

        info!(
            "replayed {} WAL events, {} live reservations",
            events.len(),
            table.by_id.len()
        );
        metrics::gauge!(crate::observability::RESERVATIONS_ACTIVE).set(table.by_id.len() as f64);
        Ok(table)
    }

    pub fn notify(&self) -> &Arc<NotifyHub> {
        &self.notify
    }

    /// Get or create the shard for `key`. Shards are never removed.
    fn shard(&self, key: SlotKey) -> SharedSlot {
        self.slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RwLock::new(SlotState::new(key))))
            .clone()
    }

    /// Claim room for one more row. Callers hold the slot's write lock.
    fn claim_row(&self) -> Result<(), StoreError> {
        self.occupied
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < self.limit).then_some(n + 1))
            .map(|_| ())
            .map_err(|_| StoreError::Other("reservation table is full".into()))
    }

    /// Log, apply and publish `event` on a task of its own. The commit runs to
    /// the end even if the caller stops waiting on the handle.
    fn spawn_commit(
        &self,
        slot: OwnedRwLockWriteGuard<SlotState>,
        shared: OwnedRwLockReadGuard<()>,
        event: Event,
    ) -> JoinHandle<Result<(), StoreError>> {
        let commit = Commit {
            wal_tx: self.wal_tx.clone(),
            by_id: self.by_id.clone(),
            occupied: self.occupied.clone(),
            notify: self.notify.clone(),
        };
        tokio::spawn(commit.run(slot, shared, event))
    }
}

fn index(by_id: &DashMap<Ulid, SlotKey>, event: &Event) {
    match event {
        Event::ReservationCreated(r) => {
            by_id.insert(r.id, r.slot_key());
        }
        Event::ReservationCancelled { id, .. } => {
            by_id.remove(id);
        }
    }
}

async fn wal_append(wal_tx: &mpsc::Sender<WalCommand>, event: &Event) -> Result<(), StoreError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append {
            event: event.clone(),
            response: tx,
        })
        .await
        .map_err(|_| StoreError::Other("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| StoreError::Other("WAL writer dropped response".into()))?
        .map_err(|e| StoreError::Other(format!("WAL error: {e}")))
}

/// Shared handles one commit needs once its caller is out of the picture.
struct Commit {
    wal_tx: mpsc::Sender<WalCommand>,
    by_id: Arc<DashMap<Ulid, SlotKey>>,
    occupied: Arc<AtomicUsize>,
    notify: Arc<NotifyHub>,
}

impl Commit {
    async fn run(
        self,
        mut slot: OwnedRwLockWriteGuard<SlotState>,
        _shared: OwnedRwLockReadGuard<()>,
        event: Event,
    ) -> Result<(), StoreError> {
        let logged = wal_append(&self.wal_tx, &event).await;
        match (&event, &logged) {
            // An insert that never made it to the log gives back its claimed row.
            (Event::ReservationCreated(_), Err(_)) | (Event::ReservationCancelled { .. }, Ok(())) => {
                self.occupied.fetch_sub(1, Ordering::AcqRel);
            }
            _ => {}
        }
        logged?;
        index(&self.by_id, &event);
        slot.apply(&event);
        self.notify.send(&ChangeEvent::from(&event));
        metrics::gauge!(crate::observability::RESERVATIONS_ACTIVE).set(self.by_id.len() as f64);
        Ok(())
    }
}

#[async_trait]
impl ReservationStore for ReservationTable {
    async fn query(&self, filter: &ReservationFilter) -> Result<Vec<Reservation>, StoreError> {
        Ok(self.select(filter).await)
    }

    async fn insert(&self, new: NewReservation) -> Result<Reservation, StoreError> {
        self.insert_reservation(new).await
    }

    async fn delete_by_id(&self, id: Ulid) -> Result<Reservation, StoreError> {
        self.delete_reservation(id).await
    }

    fn subscribe(&self) -> Subscription {
        self.notify.subscribe_all()
    }
}
