use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::protocol::{BusEvent, Envelope, Topic};

/// Per-subscriber capacity before events start being counted as missed.
const DEFAULT_CAPACITY: usize = 256;

struct Subscriber {
    topic: Topic,
    tx: flume::Sender<Envelope>,
    /// Events not delivered since the last successful send; surfaced to the
    /// consumer as a `Dropped` marker once it drains.
    missed: u64,
}

/// Two-topic pub/sub built on bounded flume channels.
///
/// Publishers never block: when a subscriber's channel is full the event is
/// counted against it, and the next delivery is preceded by a
/// [`BusEvent::Dropped`] marker carrying the missed count. Delivery order
/// within a topic is preserved; disconnected subscribers are pruned on
/// publish. Cloning the bus is cheap (shared internals behind an `Arc`).
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<Subscriber>>>,
    capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
            capacity,
        }
    }

    /// Subscribe to one ticket's room.
    pub fn subscribe_ticket(&self, ticket_id: i64) -> flume::Receiver<Envelope> {
        self.subscribe(Topic::Ticket(ticket_id))
    }

    /// Subscribe to the global console room.
    pub fn subscribe_console(&self) -> flume::Receiver<Envelope> {
        self.subscribe(Topic::Console)
    }

    fn subscribe(&self, topic: Topic) -> flume::Receiver<Envelope> {
        let (tx, rx) = flume::bounded(self.capacity);
        let mut subs = self.inner.lock().expect("EventBus lock poisoned");
        subs.push(Subscriber {
            topic,
            tx,
            missed: 0,
        });
        rx
    }

    /// Publish an event to every subscriber of `topic`.
    pub fn publish(&self, topic: Topic, event: BusEvent) {
        let mut subs = self.inner.lock().expect("EventBus lock poisoned");
        subs.retain_mut(|sub| {
            if sub.topic != topic {
                return true;
            }
            // A lagging subscriber first gets the drop marker; until that
            // fits, everything else keeps counting as missed.
            if sub.missed > 0 {
                let marker = Envelope {
                    topic,
                    event: BusEvent::Dropped { missed: sub.missed },
                    timestamp: Utc::now(),
                };
                match sub.tx.try_send(marker) {
                    Ok(()) => sub.missed = 0,
                    Err(flume::TrySendError::Full(_)) => {
                        sub.missed += 1;
                        return true;
                    }
                    Err(flume::TrySendError::Disconnected(_)) => return false,
                }
            }
            let envelope = Envelope {
                topic,
                event: event.clone(),
                timestamp: Utc::now(),
            };
            match sub.tx.try_send(envelope) {
                Ok(()) => true,
                Err(flume::TrySendError::Full(_)) => {
                    sub.missed += 1;
                    true
                }
                Err(flume::TrySendError::Disconnected(_)) => false,
            }
        });
    }

    /// Number of currently connected subscribers.
    pub fn subscriber_count(&self) -> usize {
        let mut subs = self.inner.lock().expect("EventBus lock poisoned");
        subs.retain(|sub| !sub.tx.is_disconnected());
        subs.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
