use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Stations operated at the event, in display order.
const DEFAULT_STATIONS: [&str; 6] = [
    "분자생물실험실",
    "고분자콜로이드실험실",
    "고분자약물전달실험실",
    "생체소재 및 대사질환실험실",
    "바이오의약소재실험실",
    "나노인공세포연구실",
];

/// Minutes between consecutive slot starts.
pub const SLOT_STEP_MINUTES: u32 = 20;

/// An operating window in minutes after midnight; both ends are slot starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub first: u32,
    pub last: u32,
}

/// Morning and afternoon windows. Lunch falls between them.
pub const SCHEDULE: [Window; 2] = [
    Window { first: 10 * 60, last: 11 * 60 + 40 },
    Window { first: 14 * 60, last: 15 * 60 + 20 },
];

/// The default station list.
pub fn stations() -> Vec<String> {
    DEFAULT_STATIONS.iter().map(|s| s.to_string()).collect()
}

/// All slot labels of one operating day, in order.
pub fn time_slots() -> Vec<String> {
    let mut slots = Vec::new();
    for window in SCHEDULE {
        let mut minute = window.first;
        while minute <= window.last {
            slots.push(format!("{:02}:{:02}", minute / 60, minute % 60));
            minute += SLOT_STEP_MINUTES;
        }
    }
    slots
}

pub fn is_time_slot(label: &str) -> bool {
    let Some(minute) = parse_label(label) else {
        return false;
    };
    SCHEDULE.iter().any(|w| {
        minute >= w.first && minute <= w.last && (minute - w.first) % SLOT_STEP_MINUTES == 0
    })
}

/// `HH:MM` → minutes after midnight. Only the zero-padded form is accepted.
fn parse_label(label: &str) -> Option<u32> {
    let (h, m) = label.split_once(':')?;
    if h.len() != 2 || m.len() != 2 {
        return None;
    }
    if !h.bytes().chain(m.bytes()).all(|b| b.is_ascii_digit()) {
        return None;
    }
    let h: u32 = h.parse().ok()?;
    let m: u32 = m.parse().ok()?;
    (h < 24 && m < 60).then_some(h * 60 + m)
}

/// The two days of the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Day {
    One,
    Two,
}

impl Day {
    pub const ALL: [Day; 2] = [Day::One, Day::Two];

    pub fn index(self) -> usize {
        match self {
            Day::One => 0,
            Day::Two => 1,
        }
    }
}

impl fmt::Display for Day {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Day::One => write!(f, "day 1"),
            Day::Two => write!(f, "day 2"),
        }
    }
}

/// One bookable unit: (date, station, time label).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotKey {
    pub date: NaiveDate,
    pub lab_id: String,
    pub time_slot: String,
}

impl SlotKey {
    pub fn new(date: NaiveDate, lab_id: impl Into<String>, time_slot: impl Into<String>) -> Self {
        Self {
            date,
            lab_id: lab_id.into(),
            time_slot: time_slot.into(),
        }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.date, self.lab_id, self.time_slot)
    }
}
