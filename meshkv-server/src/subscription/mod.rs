//! In-process fan-out of change events to key-, topic- and event-level
//! subscribers. Dispatch is synchronous from the emitting context; a failing
//! subscriber is unregistered without disturbing delivery to the rest.

use crate::core::events::ChangeEvent;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Handle returned on registration and used for unregister.
pub type SubscriptionId = Uuid;

/// Returned by a callback to signal the subscriber is no longer valid; the
/// hub removes it and carries on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriberGone;

pub type DispatchResult = std::result::Result<(), SubscriberGone>;

pub type EventCallback = Box<dyn Fn(&ChangeEvent) -> DispatchResult + Send + Sync>;
pub type KeyCallback = Box<dyn Fn(&str) -> DispatchResult + Send + Sync>;
pub type TopicCallback = Box<dyn Fn(&str, Option<&[u8]>) -> DispatchResult + Send + Sync>;
pub type EventFilter = Box<dyn Fn(&ChangeEvent) -> bool + Send + Sync>;

enum Registration {
    /// Full change events, optionally filtered. `bootstrap` opts into
    /// BatchComplete boundary markers.
    Events {
        filter: Option<EventFilter>,
        bootstrap: bool,
        callback: EventCallback,
    },
    /// Just the key of every mutation.
    Keys { callback: KeyCallback },
    /// (topic, payload) pairs, topic being the key; payload is None for
    /// removals.
    Topics { callback: TopicCallback },
}

/// Subscription hub for one store.
#[derive(Clone, Default)]
pub struct SubscriptionHub {
    subs: Arc<RwLock<HashMap<SubscriptionId, Registration>>>,
}

impl SubscriptionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_subscriber(
        &self,
        filter: Option<EventFilter>,
        bootstrap: bool,
        callback: EventCallback,
    ) -> SubscriptionId {
        self.insert(Registration::Events {
            filter,
            bootstrap,
            callback,
        })
    }

    pub fn register_key_subscriber(&self, callback: KeyCallback) -> SubscriptionId {
        self.insert(Registration::Keys { callback })
    }

    pub fn register_topic_subscriber(&self, callback: TopicCallback) -> SubscriptionId {
        self.insert(Registration::Topics { callback })
    }

    fn insert(&self, registration: Registration) -> SubscriptionId {
        let id = Uuid::new_v4();
        self.subs.write().insert(id, registration);
        debug!(%id, "subscriber registered");
        id
    }

    pub fn unregister(&self, id: SubscriptionId) -> bool {
        let removed = self.subs.write().remove(&id).is_some();
        if removed {
            debug!(%id, "subscriber unregistered");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subs.read().len()
    }

    /// Dispatch one event to every matching subscriber. Callbacks that
    /// report `SubscriberGone` are removed afterwards; the event still
    /// reaches everyone else.
    pub fn publish(&self, event: &ChangeEvent) {
        let mut gone: Vec<SubscriptionId> = Vec::new();

        {
            let subs = self.subs.read();
            for (id, registration) in subs.iter() {
                let result = match registration {
                    Registration::Events {
                        filter,
                        bootstrap,
                        callback,
                    } => {
                        if event.is_batch_complete() && !bootstrap {
                            continue;
                        }
                        if let Some(f) = filter {
                            if !f(event) {
                                continue;
                            }
                        }
                        callback(event)
                    }
                    Registration::Keys { callback } => match event.key() {
                        Some(key) => callback(key),
                        None => continue,
                    },
                    Registration::Topics { callback } => match event.key() {
                        Some(key) => callback(key, event.value()),
                        None => continue,
                    },
                };

                if result.is_err() {
                    gone.push(*id);
                }
            }
        }

        if !gone.is_empty() {
            let mut subs = self.subs.write();
            for id in gone {
                subs.remove(&id);
                debug!(%id, "subscriber removed after dispatch fault");
            }
        }
    }

    /// Deliver a bootstrap boundary to subscribers that opted in.
    pub fn notify_batch_complete(&self, data_up_to_ms: u64) {
        self.publish(&ChangeEvent::BatchComplete { data_up_to_ms });
    }
}
