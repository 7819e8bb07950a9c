//! The lifecycle event bus.
//!
//! Every manager and the facade itself emit [`Event`]s as they work, alongside the `tracing`
//! spans already emitted for every request, except these are also meant to be observed
//! programmatically, so they go out over a [`broadcast`] channel owned by the facade rather than
//! only through log lines.

use tokio::sync::broadcast;

/// Default capacity of the event broadcast channel. Slow subscribers that fall behind this many
/// events will see [`broadcast::error::RecvError::Lagged`] on their next receive.
const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// A lifecycle event emitted by the facade or one of its managers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    /// A connection is being (re-)established after a broker-initiated close.
    Recovering { connection_name: String },
    /// A connection, its channels and its subscriptions were fully recovered.
    Recovered { connection_name: String },
    /// A recovery attempt exhausted its retry budget.
    RecoveryFailed { connection_name: String },

    /// A message was published.
    MessagePublished { route_key: String },

    /// A consumer started receiving deliveries for a queue.
    QueueSubscribed { queue_name: String },
    /// A consumer stopped receiving deliveries for a queue.
    QueueUnsubscribed { queue_name: String },

    /// A subscription record was created in the Subscription Manager.
    SubscriptionCreated { queue_name: String },
    /// A subscription record was associated with a consumer tag.
    SubscriptionTagged { queue_name: String, consumer_tag: String },
    /// A subscription record's handler set was cleared.
    SubscriptionCleared { queue_name: String },
    /// A subscription record was removed entirely.
    SubscriptionRemoved { queue_name: String },
    /// A queue was blocked from further subscription.
    SubscriptionBlocked { queue_name: String },
    /// A previously blocked queue was unblocked.
    SubscriptionUnblocked { queue_name: String },
}

/// Owns the broadcast sender side of the event bus and hands out receivers.
///
/// This is instantiated once per facade instance, never as a process-wide singleton: two facades
/// in the same process (e.g. in tests) must not observe each other's events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    /// Creates a new event bus with the default channel capacity.
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        Self { sender }
    }

    /// Subscribes to future events. Events emitted before this call are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Emits an event to all current subscribers. A lack of subscribers is not an error.
    pub(crate) fn emit(&self, event: Event) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_emitted_event() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(Event::QueueSubscribed {
            queue_name: "orders".to_string(),
        });

        let received = rx.recv().await.unwrap();
        assert_eq!(
            received,
            Event::QueueSubscribed {
                queue_name: "orders".to_string()
            }
        );
    }

    #[tokio::test]
    async fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.emit(Event::Recovering {
            connection_name: "default".to_string(),
        });
    }
}
