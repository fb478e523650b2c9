//! Event Bus — `spec.md` §4/§6 `EventSubscriber`.
//!
//! In-memory pub/sub with a bounded buffer per subscriber. A slow subscriber
//! drops events rather than backing up the publisher; per-publisher order is
//! preserved for any subscriber that doesn't drop (a `try_send` fills the
//! channel in send order, and a full channel only ever drops the newest
//! event, never reorders older ones).

use std::sync::Mutex;

use crossbeam_channel::{Receiver, Sender};
use tbe_types::{Event, EventKind};

const SUBSCRIBER_BUFFER: usize = 50;

pub struct EventBus {
    subscribers: Mutex<Vec<Sender<Event>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Registers a new subscriber, returning the receiving end of its
    /// bounded channel. The sender is retained internally until dropped by
    /// `prune_disconnected`.
    pub fn subscribe(&self) -> Receiver<Event> {
        let (tx, rx) = crossbeam_channel::bounded(SUBSCRIBER_BUFFER);
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Publishes one event to every subscriber. Subscribers whose buffer is
    /// full simply miss this event; subscribers whose receiver has been
    /// dropped are pruned on the next publish.
    pub fn publish(&self, event: Event) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(crossbeam_channel::TrySendError::Full(_)) => {
                log::warn!("event subscriber buffer full, dropping event: {}", event.title);
                true
            }
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => false,
        });
    }

    pub fn emit(&self, kind: EventKind, category: &str, title: &str, message: &str, timestamp: i64) {
        self.publish(Event {
            kind,
            category: category.to_string(),
            title: title.to_string(),
            message: message.to_string(),
            timestamp,
        });
    }
}
