//! The Subscription Manager: a purely in-memory registry of per-queue subscription descriptors.
//!
//! Every operation here is synchronous and guarded by a single lock over the whole map -- there is
//! no I/O, so there's no reason to let two calls interleave. Lifecycle events are emitted only
//! after the mutation has taken effect.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::events::{Event, EventBus};
use crate::message::DecodedMessage;
use crate::subscription::delivery::Delivery;

pub mod delivery;

/// A handler callback: takes a decoded message and its delivery capability, returns a future that
/// resolves the delivery (via `ack`/`reject`/`requeue`) before completing.
pub type Handler =
    Arc<dyn Fn(DecodedMessage, Delivery) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Per-queue meta-options that aren't channel/connection concerns.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionOptions {
    /// Caps `retryCount` before a `requeue()` is treated as a `reject()`.
    pub max_retry_count: Option<u32>,
    /// Whether to validate the `source` header of incoming messages against a known publisher list.
    pub validate_publisher: bool,
}

/// A subscription descriptor: the handler set registered for a queue, plus its current consumer
/// tag (present only while actively consuming).
#[derive(Clone)]
pub(crate) struct Subscription {
    pub(crate) queue: String,
    pub(crate) handlers: HashMap<String, Handler>,
    pub(crate) options: SubscriptionOptions,
    pub(crate) consumer_tag: Option<String>,
}

impl Subscription {
    /// Resolves a handler for `route_key`: an exact match first, then the best-matching wildcard
    /// pattern (most specific, i.e. fewest wildcard segments, wins on ties by declaration order).
    pub(crate) fn resolve(&self, route_key: &str) -> Option<&Handler> {
        if let Some(handler) = self.handlers.get(route_key) {
            return Some(handler);
        }

        self.handlers
            .iter()
            .filter(|(pattern, _)| pattern_matches(pattern, route_key))
            .min_by_key(|(pattern, _)| wildcard_segment_count(pattern))
            .map(|(_, handler)| handler)
    }
}

/// Matches an AMQP topic-exchange binding pattern (`*` = exactly one segment, `#` = zero or more
/// segments, `.`-delimited) against a concrete routing key.
fn pattern_matches(pattern: &str, route_key: &str) -> bool {
    let pattern_segments: Vec<&str> = pattern.split('.').collect();
    let key_segments: Vec<&str> = route_key.split('.').collect();
    matches_from(&pattern_segments, &key_segments)
}

fn matches_from(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.first() {
        None => key.is_empty(),
        Some(&"#") => {
            matches_from(&pattern[1..], key)
                || (!key.is_empty() && matches_from(pattern, &key[1..]))
        }
        Some(&"*") => !key.is_empty() && matches_from(&pattern[1..], &key[1..]),
        Some(segment) => {
            !key.is_empty() && *segment == key[0] && matches_from(&pattern[1..], &key[1..])
        }
    }
}

fn wildcard_segment_count(pattern: &str) -> usize {
    pattern.split('.').filter(|s| *s == "*" || *s == "#").count()
}

/// Owns every queue's subscription descriptor and the set of blocked queue names.
pub(crate) struct SubscriptionManager {
    subscriptions: Mutex<HashMap<String, Subscription>>,
    blocked: Mutex<HashSet<String>>,
    events: EventBus,
}

impl SubscriptionManager {
    pub(crate) fn new(events: EventBus) -> Self {
        Self {
            subscriptions: Mutex::new(HashMap::new()),
            blocked: Mutex::new(HashSet::new()),
            events,
        }
    }

    /// Inserts a subscription descriptor if one doesn't already exist for `queue`. Returns `true`
    /// on insert, `false` on collision.
    pub(crate) fn create(
        &self,
        queue: String,
        handlers: HashMap<String, Handler>,
        options: SubscriptionOptions,
    ) -> bool {
        let mut subscriptions = self.subscriptions.lock();
        if subscriptions.contains_key(&queue) {
            return false;
        }
        subscriptions.insert(
            queue.clone(),
            Subscription {
                queue: queue.clone(),
                handlers,
                options,
                consumer_tag: None,
            },
        );
        drop(subscriptions);
        self.events.emit(Event::SubscriptionCreated { queue_name: queue });
        true
    }

    /// Attaches a consumer tag to an existing subscription. Returns `true` iff the subscription
    /// existed.
    pub(crate) fn tag(&self, queue: &str, consumer_tag: String) -> bool {
        let mut subscriptions = self.subscriptions.lock();
        let Some(subscription) = subscriptions.get_mut(queue) else {
            return false;
        };
        subscription.consumer_tag = Some(consumer_tag.clone());
        drop(subscriptions);
        self.events.emit(Event::SubscriptionTagged {
            queue_name: queue.to_string(),
            consumer_tag,
        });
        true
    }

    /// Returns a defensive copy of the subscription descriptor for `queue`, if any.
    pub(crate) fn get(&self, queue: &str) -> Option<Subscription> {
        self.subscriptions.lock().get(queue).cloned()
    }

    /// Returns whether a subscription exists for `queue`, optionally requiring it to have an
    /// active consumer tag.
    pub(crate) fn contains(&self, queue: &str, require_tag: bool) -> bool {
        let subscriptions = self.subscriptions.lock();
        match subscriptions.get(queue) {
            Some(subscription) => !require_tag || subscription.consumer_tag.is_some(),
            None => false,
        }
    }

    /// Clears the consumer tag for `queue`, if present. Returns `true` iff the subscription
    /// existed.
    pub(crate) fn clear(&self, queue: &str) -> bool {
        let mut subscriptions = self.subscriptions.lock();
        let Some(subscription) = subscriptions.get_mut(queue) else {
            return false;
        };
        subscription.consumer_tag = None;
        drop(subscriptions);
        self.events.emit(Event::SubscriptionCleared {
            queue_name: queue.to_string(),
        });
        true
    }

    /// Removes the subscription descriptor for `queue` entirely. Returns `true` iff it existed.
    pub(crate) fn remove(&self, queue: &str) -> bool {
        let removed = self.subscriptions.lock().remove(queue).is_some();
        if removed {
            self.events.emit(Event::SubscriptionRemoved {
                queue_name: queue.to_string(),
            });
        }
        removed
    }

    /// Clears the consumer tag for every subscription, emitting `subscription.cleared` per entry.
    pub(crate) fn clear_all(&self) {
        let queues: Vec<String> = self.subscriptions.lock().keys().cloned().collect();
        for queue in queues {
            self.clear(&queue);
        }
    }

    /// Returns a snapshot of every current subscription descriptor.
    pub(crate) fn list(&self) -> Vec<Subscription> {
        self.subscriptions.lock().values().cloned().collect()
    }

    /// Blocks `queue` from future subscription attempts. Returns `true` iff newly blocked.
    pub(crate) fn block(&self, queue: &str) -> bool {
        let newly_blocked = self.blocked.lock().insert(queue.to_string());
        if newly_blocked {
            self.events.emit(Event::SubscriptionBlocked {
                queue_name: queue.to_string(),
            });
        }
        newly_blocked
    }

    /// Unblocks `queue`. Returns `true` iff it was previously blocked.
    pub(crate) fn unblock(&self, queue: &str) -> bool {
        let was_blocked = self.blocked.lock().remove(queue);
        if was_blocked {
            self.events.emit(Event::SubscriptionUnblocked {
                queue_name: queue.to_string(),
            });
        }
        was_blocked
    }

    /// Returns whether `queue` is currently blocked.
    pub(crate) fn is_blocked(&self, queue: &str) -> bool {
        self.blocked.lock().contains(queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_handler() -> Handler {
        Arc::new(|_msg, _delivery| Box::pin(async {}))
    }

    #[test]
    fn create_rejects_duplicate_queue() {
        let manager = SubscriptionManager::new(EventBus::new());
        assert!(manager.create(
            "orders".to_string(),
            HashMap::new(),
            SubscriptionOptions::default()
        ));
        assert!(!manager.create(
            "orders".to_string(),
            HashMap::new(),
            SubscriptionOptions::default()
        ));
    }

    #[test]
    fn contains_respects_require_tag() {
        let manager = SubscriptionManager::new(EventBus::new());
        manager.create("orders".to_string(), HashMap::new(), SubscriptionOptions::default());
        assert!(manager.contains("orders", false));
        assert!(!manager.contains("orders", true));

        manager.tag("orders", "tag-1".to_string());
        assert!(manager.contains("orders", true));
    }

    #[test]
    fn clear_removes_tag_but_keeps_descriptor() {
        let manager = SubscriptionManager::new(EventBus::new());
        manager.create("orders".to_string(), HashMap::new(), SubscriptionOptions::default());
        manager.tag("orders", "tag-1".to_string());
        assert!(manager.clear("orders"));
        assert!(manager.contains("orders", false));
        assert!(!manager.contains("orders", true));
    }

    #[test]
    fn block_and_unblock_round_trip() {
        let manager = SubscriptionManager::new(EventBus::new());
        assert!(manager.block("orders"));
        assert!(!manager.block("orders"));
        assert!(manager.is_blocked("orders"));
        assert!(manager.unblock("orders"));
        assert!(!manager.is_blocked("orders"));
    }

    #[test]
    fn resolve_prefers_exact_match_over_wildcard() {
        let mut handlers = HashMap::new();
        handlers.insert("order.created".to_string(), noop_handler());
        handlers.insert("order.*".to_string(), noop_handler());
        let subscription = Subscription {
            queue: "orders".to_string(),
            handlers,
            options: SubscriptionOptions::default(),
            consumer_tag: None,
        };

        let exact = subscription.handlers.get("order.created").unwrap();
        let resolved = subscription.resolve("order.created").unwrap();
        assert!(Arc::ptr_eq(exact, resolved));
    }

    #[test]
    fn resolve_matches_hash_wildcard_across_segments() {
        let mut handlers = HashMap::new();
        handlers.insert("order.#".to_string(), noop_handler());
        let subscription = Subscription {
            queue: "orders".to_string(),
            handlers,
            options: SubscriptionOptions::default(),
            consumer_tag: None,
        };

        assert!(subscription.resolve("order.created.eu").is_some());
        assert!(subscription.resolve("shipment.created").is_none());
    }
}
