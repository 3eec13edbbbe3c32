mod classify;
mod error;
mod validate;

pub use classify::{classify, seat_markers, selection_allowed, slot_board, Seat, SlotStatus, SlotView};
pub use error::{Field, ReservationError, ValidationError};

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::catalog::SlotKey;
use crate::config::EventConfig;
use crate::model::*;
use crate::store::ReservationStore;

use validate::{validate_booking, validate_cancel};

/// Intent to book one slot.
#[derive(Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub student_id: String,
    pub student_name: Option<String>,
    pub auth_number: String,
    pub slot: SlotKey,
}

impl std::fmt::Debug for BookingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BookingRequest")
            .field("student_id", &self.student_id)
            .field("student_name", &self.student_name)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

/// Intent to cancel the identity's reservation in one slot.
#[derive(Clone, PartialEq, Eq)]
pub struct CancelRequest {
    pub student_id: String,
    pub auth_number: String,
    pub slot: SlotKey,
}

impl std::fmt::Debug for CancelRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelRequest")
            .field("student_id", &self.student_id)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

/// Enforces the booking rules on top of a `ReservationStore`.
///
/// Holds no reservation state. Every decision is made against the `known`
/// snapshot the caller passes in. Creates are then re-checked against a fresh
/// read under `commit`, so callers sharing one engine never over-allocate a
/// slot or a quota. Engines on separate processes sharing a store only get
/// the store's uniqueness guarantee.
pub struct ReservationEngine<S> {
    store: Arc<S>,
    config: Arc<EventConfig>,
    commit: Mutex<()>,
}

impl<S: ReservationStore> ReservationEngine<S> {
    pub fn new(store: Arc<S>, config: Arc<EventConfig>) -> Self {
        Self {
            store,
            config,
            commit: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &EventConfig {
        &self.config
    }

    /// Every reservation of the event, straight from the store.
    pub async fn snapshot(&self) -> Result<Vec<Reservation>, ReservationError> {
        self.store
            .query(&ReservationFilter::dates(self.config.days))
            .await
            .map_err(|e| ReservationError::Store(e.to_string()))
    }

    pub async fn attempt_create(
        &self,
        req: &BookingRequest,
        known: &[Reservation],
    ) -> Result<Reservation, ReservationError> {
        let result = self.create_inner(req, known).await;
        match &result {
            Ok(r) => {
                info!(id = %r.id, student_id = %r.student_id, slot = %req.slot, "reservation created");
                metrics::counter!(crate::observability::RESERVATIONS_CREATED_TOTAL).increment(1);
            }
            Err(e) => record_rejection("create", req.slot.clone(), e),
        }
        result
    }

    async fn create_inner(
        &self,
        req: &BookingRequest,
        known: &[Reservation],
    ) -> Result<Reservation, ReservationError> {
        validate_booking(&self.config, req)?;
        // Cheap rejection from what the caller already knows, before touching the store.
        check_admission(&self.config, req, known.iter())?;

        let _commit = self.commit.lock().await;
        let fresh = self.known_for(&req.student_id, &req.slot).await?;
        check_admission(&self.config, req, fresh.iter())?;

        let new = NewReservation {
            student_id: req.student_id.clone(),
            student_name: req
                .student_name
                .as_deref()
                .map(str::trim)
                .filter(|n| !n.is_empty())
                .map(String::from),
            auth_number: req.auth_number.clone(),
            slot: req.slot.clone(),
        };
        self.store
            .insert(new)
            .await
            .map_err(ReservationError::from_insert)
    }

    pub async fn attempt_cancel(
        &self,
        req: &CancelRequest,
        known: &[Reservation],
    ) -> Result<Reservation, ReservationError> {
        let result = self.cancel_inner(req, known).await;
        match &result {
            Ok(r) => {
                info!(id = %r.id, student_id = %r.student_id, slot = %req.slot, "reservation cancelled");
                metrics::counter!(crate::observability::RESERVATIONS_CANCELLED_TOTAL).increment(1);
            }
            Err(e) => record_rejection("cancel", req.slot.clone(), e),
        }
        result
    }

    async fn cancel_inner(
        &self,
        req: &CancelRequest,
        known: &[Reservation],
    ) -> Result<Reservation, ReservationError> {
        validate_cancel(req)?;
        let target = known
            .iter()
            .find(|r| r.is_in_slot(&req.slot) && r.is_held_by(&req.student_id))
            .ok_or(ReservationError::NotFound)?;

        if target.auth_number != req.auth_number && !self.config.is_master_code(&req.auth_number) {
            return Err(ReservationError::AuthMismatch);
        }
        if target.auth_number != req.auth_number {
            info!(id = %target.id, "cancellation authorised by master code");
        }

        self.store
            .delete_by_id(target.id)
            .await
            .map_err(ReservationError::from_delete)
    }

    /// `attempt_create` against a fresh snapshot.
    pub async fn create(&self, req: &BookingRequest) -> Result<Reservation, ReservationError> {
        let known = self.known_for(&req.student_id, &req.slot).await?;
        self.attempt_create(req, &known).await
    }

    /// `attempt_cancel` against a fresh snapshot.
    pub async fn cancel(&self, req: &CancelRequest) -> Result<Reservation, ReservationError> {
        let known = self.known_for(&req.student_id, &req.slot).await?;
        self.attempt_cancel(req, &known).await
    }

    /// The identity's rows across the event plus everyone else's rows in `slot`.
    async fn known_for(&self, student_id: &str, slot: &SlotKey) -> Result<Vec<Reservation>, ReservationError> {
        let mut known = self
            .store
            .query(&ReservationFilter::dates(self.config.days).with_student(student_id))
            .await
            .map_err(|e| ReservationError::Store(e.to_string()))?;
        let slot_rows = self
            .store
            .query(&ReservationFilter::slot(slot))
            .await
            .map_err(|e| ReservationError::Store(e.to_string()))?;
        known.extend(slot_rows.into_iter().filter(|r| !r.is_held_by(student_id)));
        Ok(known)
    }
}

/// Duplicate, quota, capacity; checked in that order.
fn check_admission<'a>(
    config: &EventConfig,
    req: &BookingRequest,
    known: impl Iterator<Item = &'a Reservation>,
) -> Result<(), ReservationError> {
    let mut held = 0usize;
    let mut in_slot = 0usize;
    for r in known {
        let mine = r.is_held_by(&req.student_id);
        let here = r.is_in_slot(&req.slot);
        if mine && here {
            return Err(ReservationError::DuplicateBooking);
        }
        if mine && config.day_of(r.date).is_some() {
            held += 1;
        }
        if here {
            in_slot += 1;
        }
    }
    if held >= config.max_reservations_per_student as usize {
        return Err(ReservationError::QuotaExceeded {
            limit: config.max_reservations_per_student,
        });
    }
    if in_slot >= config.max_reservations_per_slot as usize {
        return Err(ReservationError::SlotFull {
            capacity: config.max_reservations_per_slot,
        });
    }
    Ok(())
}

fn record_rejection(op: &'static str, slot: SlotKey, e: &ReservationError) {
    metrics::counter!(
        crate::observability::RESERVATION_REJECTIONS_TOTAL,
        "op" => op,
        "reason" => e.kind()
    )
    .increment(1);
    if e.is_retryable() {
        warn!(%slot, "{op} failed: {e}");
    } else {
        debug!(%slot, "{op} rejected: {e}");
    }
}
