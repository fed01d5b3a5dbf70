//! Publish/subscribe bus connecting the supervisor and update checker to
//! whichever listeners currently exist.
//!
//! Delivery is synchronous and in registration order. Nothing is buffered: a
//! listener that subscribes after an event was published never sees it, so
//! callers that need the current state query it after subscribing.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc;
use tracing::{trace, warn};

use crate::events::{Notification, Topic};

type Callback = Arc<dyn Fn(&Notification) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: HashMap<Topic, Vec<(u64, Callback)>>,
}

/// Cheap to clone; all clones share one registry.
#[derive(Clone, Default)]
pub struct NotificationBus {
    registry: Arc<Mutex<Registry>>,
}

/// Handle returned by `subscribe`; pass it to `unsubscribe` to stop delivery.
#[must_use = "dropping a Subscription keeps the callback registered; call unsubscribe() to remove it"]
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    entries: Vec<(Topic, u64)>,
}

impl NotificationBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, topic: Topic, callback: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.subscribe_many(&[topic], callback)
    }

    /// Registers one callback for several topics under a single handle.
    pub fn subscribe_many<F>(&self, topics: &[Topic], callback: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let callback: Callback = Arc::new(callback);
        let mut registry = lock(&self.registry);
        let mut entries = Vec::with_capacity(topics.len());
        for topic in topics {
            let id = registry.next_id;
            registry.next_id += 1;
            registry
                .subscribers
                .entry(*topic)
                .or_default()
                .push((id, callback.clone()));
            entries.push((*topic, id));
        }
        Subscription {
            registry: Arc::downgrade(&self.registry),
            entries,
        }
    }

    /// Forwards the given topics into an unbounded channel for async listeners.
    pub fn subscribe_channel(
        &self,
        topics: &[Topic],
    ) -> (Subscription, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = self.subscribe_many(topics, move |notification| {
            let _ = tx.send(notification.clone());
        });
        (subscription, rx)
    }

    /// Delivers `notification` to every subscriber of its topic.
    ///
    /// A panicking subscriber is logged and skipped; the rest still run.
    /// Returns how many subscribers completed normally.
    pub fn notify(&self, notification: &Notification) -> usize {
        let topic = notification.topic();
        let callbacks: Vec<Callback> = lock(&self.registry)
            .subscribers
            .get(&topic)
            .map(|entries| entries.iter().map(|(_, cb)| cb.clone()).collect())
            .unwrap_or_default();
        trace!(event = %notification.wire_name(), subscribers = callbacks.len(), "notify");

        let mut delivered = 0;
        for callback in callbacks {
            match panic::catch_unwind(AssertUnwindSafe(|| callback(notification))) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    warn!(event = %notification.wire_name(), "subscriber panicked while handling event")
                }
            }
        }
        delivered
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        lock(&self.registry)
            .subscribers
            .get(&topic)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl Subscription {
    pub fn unsubscribe(self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = lock(&registry);
        for (topic, id) in &self.entries {
            if let Some(entries) = registry.subscribers.get_mut(topic) {
                entries.retain(|(entry_id, _)| entry_id != id);
            }
        }
    }
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
