use crate::catalog::{self, SlotKey};
use crate::config::EventConfig;
use crate::model::Reservation;

/// How a slot presents itself to one identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Mine,
    Disabled,
    Full,
    Partially,
    Available,
}

impl SlotStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SlotStatus::Mine => "mine",
            SlotStatus::Disabled => "disabled",
            SlotStatus::Full => "full",
            SlotStatus::Partially => "partially",
            SlotStatus::Available => "available",
        }
    }
}

/// Classify one slot. Rules are tried in order and the first match wins:
/// mine, disabled, full, partially, available.
///
/// `slot_reservations` must already be restricted to the slot; `identity_total`
/// is the identity's booking count across the whole event.
pub fn classify(
    slot_reservations: &[Reservation],
    identity: Option<&str>,
    identity_total: usize,
    capacity: u32,
    quota: u32,
) -> SlotStatus {
    let count = slot_reservations.len();
    if let Some(id) = identity
        && slot_reservations.iter().any(|r| r.is_held_by(id))
    {
        return SlotStatus::Mine;
    }
    if identity_total >= quota as usize {
        return SlotStatus::Disabled;
    }
    if count >= capacity as usize {
        SlotStatus::Full
    } else if count > 0 {
        SlotStatus::Partially
    } else {
        SlotStatus::Available
    }
}

/// One marker per unit of capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seat {
    Mine,
    Taken,
    Open,
}

/// Seat markers in booking order, padded with `Open` up to `capacity`.
pub fn seat_markers(slot_reservations: &[Reservation], identity: Option<&str>, capacity: u32) -> Vec<Seat> {
    (0..capacity as usize)
        .map(|i| match slot_reservations.get(i) {
            Some(r) if identity.is_some_and(|id| r.is_held_by(id)) => Seat::Mine,
            Some(_) => Seat::Taken,
            None => Seat::Open,
        })
        .collect()
}

/// Whether the identity may open a slot at all. Only an empty slot is closed
/// to an identity whose quota is used up; occupied slots stay open for viewing
/// and cancelling.
pub fn selection_allowed(slot_reservations: &[Reservation], identity_total: usize, quota: u32) -> bool {
    !(identity_total >= quota as usize && slot_reservations.is_empty())
}

/// Per-slot summary of one station on one day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotView {
    pub time_slot: String,
    pub booked: usize,
    pub capacity: u32,
    pub status: SlotStatus,
    pub seats: Vec<Seat>,
    pub selectable: bool,
}

/// Build the timetable of `lab_id` on `date` from a snapshot of reservations.
/// The snapshot may hold anything; only relevant rows are used.
pub fn slot_board(
    config: &EventConfig,
    date: chrono::NaiveDate,
    lab_id: &str,
    identity: Option<&str>,
    snapshot: &[Reservation],
) -> Vec<SlotView> {
    let identity_total = identity.map_or(0, |id| {
        snapshot
            .iter()
            .filter(|r| r.is_held_by(id) && config.day_of(r.date).is_some())
            .count()
    });
    let capacity = config.max_reservations_per_slot;
    let quota = config.max_reservations_per_student;
    catalog::time_slots()
        .into_iter()
        .map(|time_slot| {
            let key = SlotKey::new(date, lab_id, time_slot.clone());
            let here: Vec<Reservation> = snapshot
                .iter()
                .filter(|r| r.is_in_slot(&key))
                .cloned()
                .collect();
            SlotView {
                booked: here.len(),
                capacity,
                status: classify(&here, identity, identity_total, capacity, quota),
                seats: seat_markers(&here, identity, capacity),
                selectable: selection_allowed(&here, identity_total, quota),
                time_slot,
            }
        })
        .collect()
}
