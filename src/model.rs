use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::catalog::SlotKey;

/// A persisted reservation. Never updated in place.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Ulid,
    pub student_id: String,
    pub student_name: Option<String>,
    pub auth_number: String,
    pub date: NaiveDate,
    pub lab_id: String,
    pub time_slot: String,
}

impl Reservation {
    pub fn from_new(id: Ulid, new: NewReservation) -> Self {
        Self {
            id,
            student_id: new.student_id,
            student_name: new.student_name,
            auth_number: new.auth_number,
            date: new.slot.date,
            lab_id: new.slot.lab_id,
            time_slot: new.slot.time_slot,
        }
    }

    pub fn slot_key(&self) -> SlotKey {
        SlotKey::new(self.date, self.lab_id.clone(), self.time_slot.clone())
    }

    pub fn is_in_slot(&self, slot: &SlotKey) -> bool {
        self.date == slot.date && self.lab_id == slot.lab_id && self.time_slot == slot.time_slot
    }

    pub fn is_held_by(&self, student_id: &str) -> bool {
        self.student_id == student_id
    }
}

// The code is a shared secret; keep it out of logs.
impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("id", &self.id)
            .field("student_id", &self.student_id)
            .field("student_name", &self.student_name)
            .field("auth_number", &"****")
            .field("date", &self.date)
            .field("lab_id", &self.lab_id)
            .field("time_slot", &self.time_slot)
            .finish()
    }
}

/// Insert payload; the store assigns the id.
#[derive(Clone, PartialEq, Eq)]
pub struct NewReservation {
    pub student_id: String,
    pub student_name: Option<String>,
    pub auth_number: String,
    pub slot: SlotKey,
}

impl fmt::Debug for NewReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewReservation")
            .field("student_id", &self.student_id)
            .field("student_name", &self.student_name)
            .field("slot", &self.slot)
            .finish_non_exhaustive()
    }
}

/// Query filter. Empty `dates` matches every date; `None` fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationFilter {
    pub dates: Vec<NaiveDate>,
    pub lab_id: Option<String>,
    pub student_id: Option<String>,
    pub time_slot: Option<String>,
}

impl ReservationFilter {
    pub fn dates(dates: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            dates: dates.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn slot(slot: &SlotKey) -> Self {
        Self {
            dates: vec![slot.date],
            lab_id: Some(slot.lab_id.clone()),
            student_id: None,
            time_slot: Some(slot.time_slot.clone()),
        }
    }

    pub fn with_lab(mut self, lab_id: impl Into<String>) -> Self {
        self.lab_id = Some(lab_id.into());
        self
    }

    pub fn with_student(mut self, student_id: impl Into<String>) -> Self {
        self.student_id = Some(student_id.into());
        self
    }

    pub fn with_time_slot(mut self, time_slot: impl Into<String>) -> Self {
        self.time_slot = Some(time_slot.into());
        self
    }

    /// Whether any reservation in `slot` could match. Used to skip whole shards.
    pub fn admits_slot(&self, slot: &SlotKey) -> bool {
        (self.dates.is_empty() || self.dates.contains(&slot.date))
            && self.lab_id.as_ref().is_none_or(|l| *l == slot.lab_id)
            && self.time_slot.as_ref().is_none_or(|t| *t == slot.time_slot)
    }

    pub fn matches(&self, r: &Reservation) -> bool {
        (self.dates.is_empty() || self.dates.contains(&r.date))
            && self.lab_id.as_ref().is_none_or(|l| *l == r.lab_id)
            && self.time_slot.as_ref().is_none_or(|t| *t == r.time_slot)
            && self.student_id.as_ref().is_none_or(|s| *s == r.student_id)
    }
}

/// WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    ReservationCreated(Reservation),
    ReservationCancelled { id: Ulid, slot: SlotKey },
}

impl Event {
    pub fn slot(&self) -> SlotKey {
        match self {
            Event::ReservationCreated(r) => r.slot_key(),
            Event::ReservationCancelled { slot, .. } => slot.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOp {
    Insert,
    Delete,
}

/// What subscribers see of a mutation. Carries no identity or code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub op: ChangeOp,
    pub id: Ulid,
    pub date: NaiveDate,
    pub lab_id: String,
    pub time_slot: String,
}

impl From<&Event> for ChangeEvent {
    fn from(event: &Event) -> Self {
        match event {
            Event::ReservationCreated(r) => ChangeEvent {
                op: ChangeOp::Insert,
                id: r.id,
                date: r.date,
                lab_id: r.lab_id.clone(),
                time_slot: r.time_slot.clone(),
            },
            Event::ReservationCancelled { id, slot } => ChangeEvent {
                op: ChangeOp::Delete,
                id: *id,
                date: slot.date,
                lab_id: slot.lab_id.clone(),
                time_slot: slot.time_slot.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 11, d).unwrap()
    }

    fn reservation(student: &str, date: NaiveDate, lab: &str, slot: &str) -> Reservation {
        Reservation::from_new(
            Ulid::new(),
            NewReservation {
                student_id: student.into(),
                student_name: None,
                auth_number: "1234".into(),
                slot: SlotKey::new(date, lab, slot),
            },
        )
    }

    #[test]
    fn empty_filter_matches_everything() {
        let f = ReservationFilter::default();
        assert!(f.matches(&reservation("a", day(11), "X", "10:00")));
        assert!(f.matches(&reservation("b", day(12), "Y", "15:20")));
    }

    #[test]
    fn filter_by_date_set() {
        let f = ReservationFilter::dates([day(11)]);
        assert!(f.matches(&reservation("a", day(11), "X", "10:00")));
        assert!(!f.matches(&reservation("a", day(12), "X", "10:00")));
    }

    #[test]
    fn filter_combines_fields() {
        let f = ReservationFilter::dates([day(11), day(12)])
            .with_lab("X")
            .with_student("a");
        assert!(f.matches(&reservation("a", day(12), "X", "10:00")));
        assert!(!f.matches(&reservation("b", day(12), "X", "10:00")));
        assert!(!f.matches(&reservation("a", day(12), "Y", "10:00")));
    }

    #[test]
    fn slot_filter_admits_only_that_slot() {
        let key = SlotKey::new(day(11), "X", "10:00");
        let f = ReservationFilter::slot(&key);
        assert!(f.admits_slot(&key));
        assert!(!f.admits_slot(&SlotKey::new(day(11), "X", "10:20")));
        assert!(!f.admits_slot(&SlotKey::new(day(12), "X", "10:00")));
    }

    #[test]
    fn debug_hides_auth_number() {
        let r = reservation("a", day(11), "X", "10:00");
        let printed = format!("{r:?}");
        assert!(!printed.contains("1234"));
        assert!(printed.contains("****"));
    }

    #[test]
    fn change_event_omits_identity() {
        let r = reservation("202512345", day(11), "X", "10:00");
        let change = ChangeEvent::from(&Event::ReservationCreated(r.clone()));
        assert_eq!(change.op, ChangeOp::Insert);
        assert_eq!(change.id, r.id);
        let json = serde_json::to_string(&change).unwrap();
        assert!(!json.contains("202512345"));
        assert!(json.contains("\"op\":\"insert\""));
    }

    #[test]
    fn event_serialization_roundtrip() {
        let event = Event::ReservationCreated(reservation("a", day(11), "X", "10:00"));
        let bytes = bincode::serialize(&event).unwrap();
        let decoded: Event = bincode::deserialize(&bytes).unwrap();
        assert_eq!(event, decoded);
    }
}
