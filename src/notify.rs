use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use crate::model::ChangeEvent;

const CHANNEL_CAPACITY: usize = 256;

/// Base name of the `LISTEN` channels.
pub const CHANNEL_PREFIX: &str = "reservations";

/// A named change feed: `reservations` or `reservations_YYYYMMDD`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    All,
    Day(NaiveDate),
}

impl Channel {
    pub fn parse(name: &str) -> Option<Self> {
        let name = name.trim().trim_matches('"').to_ascii_lowercase();
        let rest = name.strip_prefix(CHANNEL_PREFIX)?;
        if rest.is_empty() {
            return Some(Channel::All);
        }
        let digits = rest.strip_prefix('_')?;
        if digits.len() != 8 {
            return None;
        }
        NaiveDate::parse_from_str(digits, "%Y%m%d").ok().map(Channel::Day)
    }

    pub fn name(&self) -> String {
        match self {
            Channel::All => CHANNEL_PREFIX.to_string(),
            Channel::Day(date) => format!("{CHANNEL_PREFIX}_{}", date.format("%Y%m%d")),
        }
    }
}

/// Broadcast hub for reservation changes: one feed for everything plus one per date.
pub struct NotifyHub {
    all: broadcast::Sender<ChangeEvent>,
    days: DashMap<NaiveDate, broadcast::Sender<ChangeEvent>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            all: broadcast::channel(CHANNEL_CAPACITY).0,
            days: DashMap::new(),
        }
    }

    pub fn subscribe_all(&self) -> Subscription {
        Subscription::new(self.all.subscribe())
    }

    /// Changes touching one date only. Creates the channel if needed.
    pub fn subscribe_day(&self, date: NaiveDate) -> Subscription {
        let sender = self
            .days
            .entry(date)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        Subscription::new(sender.subscribe())
    }

    pub fn subscribe(&self, channel: Channel) -> Subscription {
        match channel {
            Channel::All => self.subscribe_all(),
            Channel::Day(date) => self.subscribe_day(date),
        }
    }

    /// Publish a change. No-op for channels nobody listens on.
    pub fn send(&self, change: &ChangeEvent) {
        let _ = self.all.send(change.clone());
        if let Some(sender) = self.days.get(&change.date) {
            let _ = sender.send(change.clone());
        }
    }
}

/// What a subscriber learns on wakeup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Changed(ChangeEvent),
    /// The receiver fell behind and `n` changes were dropped. State must be re-read.
    Missed(u64),
}

/// A live handle on a change feed.
pub struct Subscription {
    rx: broadcast::Receiver<ChangeEvent>,
}

impl Subscription {
    fn new(rx: broadcast::Receiver<ChangeEvent>) -> Self {
        Self { rx }
    }

    /// Wait for the next change. `None` once the hub is gone.
    pub async fn next(&mut self) -> Option<Notice> {
        match self.rx.recv().await {
            Ok(change) => Some(Notice::Changed(change)),
            Err(RecvError::Lagged(n)) => Some(Notice::Missed(n)),
            Err(RecvError::Closed) => None,
        }
    }

    /// Non-blocking variant of `next`. `None` when nothing is pending.
    pub fn try_next(&mut self) -> Option<Notice> {
        match self.rx.try_recv() {
            Ok(change) => Some(Notice::Changed(change)),
            Err(TryRecvError::Lagged(n)) => Some(Notice::Missed(n)),
            Err(TryRecvError::Empty | TryRecvError::Closed) => None,
        }
    }
}
