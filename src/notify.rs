use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Booking;

const CHANNEL_CAPACITY: usize = 256;

/// Outbound booking change, consumed by notification and broadcast services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingEvent {
    Created(Booking),
    Updated(Booking),
    Deleted(Booking),
}

impl BookingEvent {
    pub fn booking(&self) -> &Booking {
        match self {
            BookingEvent::Created(b) | BookingEvent::Updated(b) | BookingEvent::Deleted(b) => b,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            BookingEvent::Created(_) => "created",
            BookingEvent::Updated(_) => "updated",
            BookingEvent::Deleted(_) => "deleted",
        }
    }
}

/// Fire-and-forget fan-out: one system-wide feed plus one feed per owner.
/// Publishing never blocks and never fails the booking operation.
pub struct NotifyHub {
    all: broadcast::Sender<BookingEvent>,
    by_owner: DashMap<Ulid, broadcast::Sender<BookingEvent>>,
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
            by_owner: DashMap::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BookingEvent> {
        self.all.subscribe()
    }

    /// Events for one client's bookings. Creates the channel if needed.
    pub fn subscribe_owner(&self, owner_id: Ulid) -> broadcast::Receiver<BookingEvent> {
        let sender = self
            .by_owner
            .entry(owner_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// No-op if nobody is listening; slow receivers lag instead of blocking.
    pub fn publish(&self, event: BookingEvent) {
        let owner = event.booking().owner_id;
        if let Some(sender) = self.by_owner.get(&owner)
            && sender.send(event.clone()).is_err()
        {
            drop(sender);
            // Every owner subscriber is gone.
            self.by_owner.remove(&owner);
        }
        let _ = self.all.send(event);
    }
}
