use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, warn};
use ulid::Ulid;

use crate::catalog::{Day, SlotKey};
use crate::engine::{
    self, BookingRequest, CancelRequest, Field, ReservationEngine, ReservationError, SlotView,
    ValidationError,
};
use crate::model::{Reservation, ReservationFilter};
use crate::notify::Subscription;
use crate::store::ReservationStore;

/// Who is booking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub student_id: String,
    pub student_name: Option<String>,
}

/// A booking of the current identity together with the event day it falls on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MyReservation {
    pub day: Day,
    pub reservation: Reservation,
}

/// Sets the shared pending flag and clears it again on drop.
struct PendingGuard(Arc<AtomicBool>);

impl PendingGuard {
    fn raise(flag: &Arc<AtomicBool>) -> Self {
        flag.store(true, Ordering::Release);
        Self(flag.clone())
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One client's working state over a shared engine.
///
/// The local snapshot is only ever replaced wholesale by [`refresh`]; the
/// single exception is a write this session just made, which is applied
/// locally and kept provisional until the next refresh.
///
/// [`refresh`]: BookingSession::refresh
pub struct BookingSession<S> {
    engine: Arc<ReservationEngine<S>>,
    identity: Option<Identity>,
    station: Option<String>,
    day: Day,
    snapshot: Vec<Reservation>,
    pending: Arc<AtomicBool>,
    provisional: HashSet<Ulid>,
    op_timeout: Duration,
    changes: Subscription,
}

impl<S: ReservationStore> BookingSession<S> {
    pub fn new(engine: Arc<ReservationEngine<S>>, op_timeout: Duration) -> Self {
        let changes = engine.store().subscribe();
        Self {
            engine,
            identity: None,
            station: None,
            day: Day::One,
            snapshot: Vec::new(),
            pending: Arc::new(AtomicBool::new(false)),
            provisional: HashSet::new(),
            op_timeout,
            changes,
        }
    }

    // ── Selection ────────────────────────────────────────

    pub fn set_identity(&mut self, student_id: impl Into<String>, student_name: Option<String>) {
        self.identity = Some(Identity {
            student_id: student_id.into(),
            student_name,
        });
    }

    pub fn clear_identity(&mut self) {
        self.identity = None;
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn select_station(&mut self, lab_id: &str) -> Result<(), ReservationError> {
        if !self.engine.config().has_station(lab_id) {
            return Err(ValidationError::UnknownStation(lab_id.to_string()).into());
        }
        self.station = Some(lab_id.to_string());
        Ok(())
    }

    pub fn station(&self) -> Option<&str> {
        self.station.as_deref()
    }

    pub fn select_day(&mut self, day: Day) {
        self.day = day;
    }

    pub fn day(&self) -> Day {
        self.day
    }

    // ── Status ───────────────────────────────────────────

    /// Handle on the pending flag, e.g. for a front end that disables input.
    pub fn pending_flag(&self) -> Arc<AtomicBool> {
        self.pending.clone()
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> &[Reservation] {
        &self.snapshot
    }

    pub fn is_provisional(&self, id: Ulid) -> bool {
        self.provisional.contains(&id)
    }

    // ── Operations ───────────────────────────────────────

    /// Replace the local snapshot with the store's current state.
    pub async fn refresh(&mut self) -> Result<(), ReservationError> {
        let _pending = PendingGuard::raise(&self.pending);
        let filter = ReservationFilter::dates(self.engine.config().days);
        let store = self.engine.store().clone();
        let rows = bounded(self.op_timeout, async move {
            store
                .query(&filter)
                .await
                .map_err(|e| ReservationError::Store(e.to_string()))
        })
        .await?;
        self.snapshot = rows;
        self.provisional.clear();
        Ok(())
    }

    pub async fn book(&mut self, time_slot: &str, auth_number: &str) -> Result<Reservation, ReservationError> {
        let identity = self
            .identity
            .clone()
            .ok_or(ValidationError::Missing(Field::StudentId))?;
        let req = BookingRequest {
            student_id: identity.student_id,
            student_name: identity.student_name,
            auth_number: auth_number.to_string(),
            slot: self.selected_slot(time_slot)?,
        };

        let result = {
            let _pending = PendingGuard::raise(&self.pending);
            bounded(self.op_timeout, self.engine.attempt_create(&req, &self.snapshot)).await
        };
        match result {
            Ok(created) => {
                self.provisional.insert(created.id);
                self.snapshot.push(created.clone());
                self.resync("book").await;
                Ok(created)
            }
            Err(e) => {
                self.after_rejection(&e).await;
                Err(e)
            }
        }
    }

    pub async fn cancel(&mut self, time_slot: &str, auth_number: &str) -> Result<Reservation, ReservationError> {
        let student_id = self
            .identity
            .as_ref()
            .map(|i| i.student_id.clone())
            .ok_or(ValidationError::Missing(Field::StudentId))?;
        let req = CancelRequest {
            student_id,
            auth_number: auth_number.to_string(),
            slot: self.selected_slot(time_slot)?,
        };

        let result = {
            let _pending = PendingGuard::raise(&self.pending);
            bounded(self.op_timeout, self.engine.attempt_cancel(&req, &self.snapshot)).await
        };
        match result {
            Ok(removed) => {
                self.snapshot.retain(|r| r.id != removed.id);
                self.provisional.remove(&removed.id);
                self.resync("cancel").await;
                Ok(removed)
            }
            Err(e) => {
                self.after_rejection(&e).await;
                Err(e)
            }
        }
    }

    /// Wait for the next change anywhere in the event, then re-sync.
    /// Returns `false` once the change feed has closed.
    pub async fn sync_next(&mut self) -> Result<bool, ReservationError> {
        match self.changes.next().await {
            Some(notice) => {
                debug!(?notice, "change notification");
                self.refresh().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drain queued notifications without waiting. Re-syncs once if any arrived.
    pub async fn sync_pending(&mut self) -> Result<bool, ReservationError> {
        let mut seen = false;
        while self.changes.try_next().is_some() {
            seen = true;
        }
        if seen {
            self.refresh().await?;
        }
        Ok(seen)
    }

    // ── Views ────────────────────────────────────────────

    /// Timetable of the selected station on the selected day.
    pub fn slot_board(&self) -> Option<Vec<SlotView>> {
        let station = self.station.as_deref()?;
        let config = self.engine.config();
        Some(engine::slot_board(
            config,
            config.date_of(self.day),
            station,
            self.student_id(),
            &self.snapshot,
        ))
    }

    /// Whether the slot may be opened at all by the current identity.
    pub fn selection_allowed(&self, time_slot: &str) -> bool {
        let Ok(key) = self.selected_slot(time_slot) else {
            return false;
        };
        let here: Vec<Reservation> = self
            .snapshot
            .iter()
            .filter(|r| r.is_in_slot(&key))
            .cloned()
            .collect();
        engine::selection_allowed(
            &here,
            self.reservation_count(),
            self.engine.config().max_reservations_per_student,
        )
    }

    /// The identity's bookings across both days, in date/time order.
    pub fn my_reservations(&self) -> Vec<MyReservation> {
        let Some(id) = self.student_id() else {
            return Vec::new();
        };
        let config = self.engine.config();
        let mut mine: Vec<MyReservation> = self
            .snapshot
            .iter()
            .filter(|r| r.is_held_by(id))
            .filter_map(|r| {
                config.day_of(r.date).map(|day| MyReservation {
                    day,
                    reservation: r.clone(),
                })
            })
            .collect();
        mine.sort_by(|a, b| {
            (a.reservation.date, &a.reservation.time_slot, &a.reservation.lab_id).cmp(&(
                b.reservation.date,
                &b.reservation.time_slot,
                &b.reservation.lab_id,
            ))
        });
        mine
    }

    pub fn reservation_count(&self) -> usize {
        self.my_reservations().len()
    }

    // ── Internals ────────────────────────────────────────

    fn student_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.student_id.as_str())
    }

    fn selected_slot(&self, time_slot: &str) -> Result<SlotKey, ReservationError> {
        let station = self
            .station
            .as_deref()
            .ok_or(ValidationError::Missing(Field::Station))?;
        Ok(SlotKey::new(
            self.engine.config().date_of(self.day),
            station,
            time_slot,
        ))
    }

    async fn after_rejection(&mut self, e: &ReservationError) {
        if matches!(
            e,
            ReservationError::DuplicateBooking
                | ReservationError::SlotFull { .. }
                | ReservationError::QuotaExceeded { .. }
                | ReservationError::NotFound
        ) {
            self.resync("stale view").await;
        }
    }

    async fn resync(&mut self, after: &'static str) {
        if let Err(e) = self.refresh().await {
            warn!("re-sync after {after} failed: {e}");
        }
    }
}

/// Run a store-bound operation under the session timeout.
async fn bounded<T>(
    limit: Duration,
    op: impl Future<Output = Result<T, ReservationError>>,
) -> Result<T, ReservationError> {
    match tokio::time::timeout(limit, op).await {
        Ok(result) => result,
        Err(_) => Err(ReservationError::Store("timed out".into())),
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::AtomicU64;

    use async_trait::async_trait;
    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::config::EventConfig;
    use crate::engine::SlotStatus;
    use crate::model::NewReservation;
    use crate::notify::NotifyHub;
    use crate::store::{ReservationTable, StoreError};

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("labslot_test_session");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    /// Real table with injectable latency and read failures.
    struct GatedStore {
        inner: ReservationTable,
        delay_ms: AtomicU64,
        fail_queries: AtomicBool,
    }

    impl GatedStore {
        async fn pause(&self) {
            let ms = self.delay_ms.load(Ordering::SeqCst);
            if ms > 0 {
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
        }
    }

    #[async_trait]
    impl ReservationStore for GatedStore {
        async fn query(&self, filter: &ReservationFilter) -> Result<Vec<Reservation>, StoreError> {
            self.pause().await;
            if self.fail_queries.load(Ordering::SeqCst) {
                return Err(StoreError::Other("connection reset".into()));
            }
            self.inner.query(filter).await
        }

        async fn insert(&self, new: NewReservation) -> Result<Reservation, StoreError> {
            self.pause().await;
            self.inner.insert(new).await
        }

        async fn delete_by_id(&self, id: Ulid) -> Result<Reservation, StoreError> {
            self.pause().await;
            self.inner.delete_by_id(id).await
        }

        fn subscribe(&self) -> Subscription {
            self.inner.subscribe()
        }
    }

    fn engine(name: &str) -> Arc<ReservationEngine<GatedStore>> {
        let store = GatedStore {
            inner: ReservationTable::open(&test_wal_path(name), Arc::new(NotifyHub::new())).unwrap(),
            delay_ms: AtomicU64::new(0),
            fail_queries: AtomicBool::new(false),
        };
        let config = EventConfig {
            stations: vec!["X".into(), "Y".into()],
            ..EventConfig::default()
        };
        Arc::new(ReservationEngine::new(Arc::new(store), Arc::new(config)))
    }

    fn session(engine: &Arc<ReservationEngine<GatedStore>>, student_id: &str) -> BookingSession<GatedStore> {
        let mut s = BookingSession::new(engine.clone(), Duration::from_secs(5));
        s.set_identity(student_id, Some("Kim".into()));
        s.select_station("X").unwrap();
        s
    }

    #[tokio::test]
    async fn book_requires_identity_and_station() {
        let e = engine("requires_selection.wal");
        let mut s = BookingSession::new(e.clone(), Duration::from_secs(5));
        assert_eq!(
            s.book("10:00", "1234").await,
            Err(ReservationError::Validation(ValidationError::Missing(Field::StudentId)))
        );
        s.set_identity("202500001", Some("Kim".into()));
        assert_eq!(
            s.book("10:00", "1234").await,
            Err(ReservationError::Validation(ValidationError::Missing(Field::Station)))
        );
        assert!(s.select_station("Nowhere").is_err());
        assert!(s.slot_board().is_none());
    }

    #[tokio::test]
    async fn book_and_cancel_resync_local_state() {
        let e = engine("book_cancel.wal");
        let mut s = session(&e, "202500001");

        let r = assert_ok!(s.book("10:00", "1234").await);
        assert_eq!(s.snapshot(), &[r.clone()]);
        assert!(!s.is_provisional(r.id), "refresh confirms the write");
        assert_eq!(s.reservation_count(), 1);

        let board = s.slot_board().unwrap();
        let ten = board.iter().find(|v| v.time_slot == "10:00").unwrap();
        assert_eq!(ten.status, SlotStatus::Mine);

        assert_ok!(s.cancel("10:00", "1234").await);
        assert!(s.snapshot().is_empty());
        assert!(!s.is_pending());
    }

    #[tokio::test]
    async fn write_stays_provisional_when_resync_fails() {
        let e = engine("provisional.wal");
        let mut s = session(&e, "202500001");
        assert_ok!(s.refresh().await);

        e.store().fail_queries.store(true, Ordering::SeqCst);
        let r = assert_ok!(s.book("10:00", "1234").await);
        assert!(s.is_provisional(r.id));
        assert_eq!(s.snapshot().len(), 1);

        e.store().fail_queries.store(false, Ordering::SeqCst);
        assert_ok!(s.refresh().await);
        assert!(!s.is_provisional(r.id));
        assert_eq!(s.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn pending_is_set_during_operation_and_cleared_after() {
        let e = engine("pending.wal");
        let mut s = session(&e, "202500001");
        e.store().delay_ms.store(50, Ordering::SeqCst);
        let flag = s.pending_flag();

        let observer = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            flag.load(Ordering::Acquire)
        };
        let (result, seen) = tokio::join!(s.book("10:00", "1234"), observer);
        assert_ok!(result);
        assert!(seen);
        assert!(!s.is_pending());
    }

    #[tokio::test]
    async fn timeout_surfaces_store_error_and_clears_pending() {
        let e = engine("timeout.wal");
        let mut s = BookingSession::new(e.clone(), Duration::from_millis(20));
        s.set_identity("202500001", Some("Kim".into()));
        s.select_station("X").unwrap();
        e.store().delay_ms.store(200, Ordering::SeqCst);

        let err = assert_err!(s.refresh().await);
        assert_eq!(err, ReservationError::Store("timed out".into()));
        assert!(err.is_retryable());
        assert!(!s.is_pending());

        assert_err!(s.book("10:00", "1234").await);
        assert!(!s.is_pending());
    }

    #[tokio::test]
    async fn stale_view_rejection_triggers_resync() {
        let e = engine("stale_view.wal");
        let mut a = session(&e, "202500001");
        let mut b = session(&e, "202500002");
        let mut c = session(&e, "202500003");
        assert_ok!(c.refresh().await);

        assert_ok!(a.book("10:00", "1111").await);
        assert_ok!(b.book("10:00", "2222").await);

        // c still sees an empty slot, the engine re-checks against the store.
        assert_eq!(c.book("10:00", "3333").await, Err(ReservationError::SlotFull { capacity: 2 }));
        assert_eq!(c.snapshot().len(), 2);
        let ten = c
            .slot_board()
            .unwrap()
            .into_iter()
            .find(|v| v.time_slot == "10:00")
            .unwrap();
        assert_eq!(ten.status, SlotStatus::Full);
    }

    #[tokio::test]
    async fn sync_next_follows_other_sessions() {
        let e = engine("sync_next.wal");
        let mut watcher = session(&e, "202500009");
        let mut booker = session(&e, "202500001");

        assert_ok!(booker.book("14:00", "1234").await);
        assert!(assert_ok!(watcher.sync_next().await));
        assert_eq!(watcher.snapshot().len(), 1);

        assert_ok!(booker.cancel("14:00", "1234").await);
        assert!(assert_ok!(watcher.sync_pending().await));
        assert!(watcher.snapshot().is_empty());
        assert!(!assert_ok!(watcher.sync_pending().await));
    }

    #[tokio::test]
    async fn my_reservations_carry_day_and_order() {
        let e = engine("mine.wal");
        let mut s = session(&e, "202500001");
        s.select_day(Day::Two);
        assert_ok!(s.book("10:00", "1234").await);
        s.select_day(Day::One);
        s.select_station("Y").unwrap();
        assert_ok!(s.book("15:20", "1234").await);

        let mine = s.my_reservations();
        assert_eq!(mine.len(), 2);
        assert_eq!(mine[0].day, Day::One);
        assert_eq!(mine[0].reservation.time_slot, "15:20");
        assert_eq!(mine[1].day, Day::Two);
        assert_eq!(mine[1].day.to_string(), "day 2");

        // Quota used up: empty slots close, occupied ones stay open.
        assert!(!s.selection_allowed("10:00"));
        assert!(s.selection_allowed("15:20"));
        assert_eq!(
            s.book("10:00", "1234").await,
            Err(ReservationError::QuotaExceeded { limit: 2 })
        );
    }

    #[tokio::test]
    async fn wrong_code_does_not_cancel() {
        let e = engine("wrong_code.wal");
        let mut s = session(&e, "202500001");
        assert_ok!(s.book("11:40", "1234").await);
        assert_eq!(s.cancel("11:40", "4321").await, Err(ReservationError::AuthMismatch));
        assert_eq!(s.reservation_count(), 1);
    }
}
