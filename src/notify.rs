use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::{Booking, Ms, Priority};

const CHANNEL_CAPACITY: usize = 256;

/// Something a requester should hear about. Delivery (pager, SMS, ward
/// display) belongs to whoever subscribes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notice {
    BookingConfirmed {
        booking_id: Ulid,
        resource_id: Ulid,
        requester: String,
        start: Ms,
        end: Ms,
        priority: Priority,
    },
    BookingPreempted {
        booking_id: Ulid,
        resource_id: Ulid,
        requester: String,
        superseded_by: Ulid,
    },
    BookingCancelled {
        booking_id: Ulid,
        resource_id: Ulid,
        requester: String,
        reason: String,
    },
    BookingCompleted {
        booking_id: Ulid,
        resource_id: Ulid,
        requester: String,
    },
}

impl Notice {
    pub fn confirmed(b: &Booking) -> Self {
        Notice::BookingConfirmed {
            booking_id: b.id,
            resource_id: b.resource_id,
            requester: b.requester.clone(),
            start: b.span.start,
            end: b.span.end,
            priority: b.priority,
        }
    }

    pub fn resource_id(&self) -> Ulid {
        match self {
            Notice::BookingConfirmed { resource_id, .. }
            | Notice::BookingPreempted { resource_id, .. }
            | Notice::BookingCancelled { resource_id, .. }
            | Notice::BookingCompleted { resource_id, .. } => *resource_id,
        }
    }

    /// JSON body for a dispatcher.
    pub fn payload(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Fan-out of notices, both globally and per resource.
pub struct NotifyHub {
    all: broadcast::Sender<Notice>,
    channels: DashMap<Ulid, broadcast::Sender<Notice>>,
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
            channels: DashMap::new(),
        }
    }

    /// Every notice for every resource.
    pub fn subscribe_all(&self) -> broadcast::Receiver<Notice> {
        self.all.subscribe()
    }

    /// Notices for one resource. Creates the channel if needed.
    pub fn subscribe(&self, resource_id: Ulid) -> broadcast::Receiver<Notice> {
        let sender = self
            .channels
            .entry(resource_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn publish(&self, notice: Notice) {
        if let Some(sender) = self.channels.get(&notice.resource_id()) {
            let _ = sender.send(notice.clone());
        }
        let _ = self.all.send(notice);
    }
}
