use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Event, StatusLogEntry};

const CHANNEL_CAPACITY: usize = 256;

/// Outward-facing side effects other subsystems may subscribe to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    StatusChanged(StatusLogEntry),
    WorkloadChanged {
        staff_id: Ulid,
        date: NaiveDate,
        appointments_delta: i64,
        minutes_delta: i64,
    },
}

impl Notification {
    /// Only ledger entries and workload deltas leave the core.
    pub fn from_event(event: &Event) -> Option<Self> {
        match event {
            Event::StatusLogged { entry } => Some(Self::StatusChanged(entry.clone())),
            Event::WorkloadAdjusted {
                staff_id,
                date,
                appointments_delta,
                minutes_delta,
            } => Some(Self::WorkloadChanged {
                staff_id: *staff_id,
                date: *date,
                appointments_delta: *appointments_delta,
                minutes_delta: *minutes_delta,
            }),
            _ => None,
        }
    }
}

/// Broadcast hub with one channel per branch.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to a branch's notifications. Creates the channel if needed.
    pub fn subscribe(&self, branch_id: Ulid) -> broadcast::Receiver<Notification> {
        let sender = self
            .channels
            .entry(branch_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Publish the notification derived from `event`, if any.
    /// No-op if nobody is listening.
    pub fn send(&self, branch_id: Ulid, event: &Event) {
        let Some(note) = Notification::from_event(event) else {
            return;
        };
        if let Some(sender) = self.channels.get(&branch_id) {
            let _ = sender.send(note);
        }
    }

    pub fn remove(&self, branch_id: &Ulid) {
        self.channels.remove(branch_id);
    }
}
