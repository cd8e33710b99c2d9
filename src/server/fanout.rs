//! Event fan-out to connected clients.
//!
//! An injected, explicitly scoped registry of subscribers keyed by
//! authenticated identity. Publishing is fire-and-forget: delivery never
//! blocks or fails the pipeline, and a subscriber only ever sees events
//! inside its authorization scope. Slow subscribers lose events to a
//! bounded per-subscriber buffer; the authoritative state is always
//! re-fetchable from the status query.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::domain::{EventScope, StatusEvent};

/// Authenticated identity of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Identity {
    pub user_id: Uuid,
    pub clinic_id: Uuid,
}

impl Identity {
    /// Whether this identity may see events in `scope`: the owning user,
    /// or staff of the owning clinic.
    pub fn authorizes(&self, scope: EventScope) -> bool {
        self.user_id == scope.owner_id || self.clinic_id == scope.clinic_id
    }
}

struct Subscriber {
    identity: Identity,
    tx: mpsc::Sender<StatusEvent>,
}

/// Registry of live subscriptions.
pub struct SubscriberRegistry {
    subscribers: Mutex<HashMap<Uuid, Subscriber>>,

    /// Bounded buffer size per subscriber
    buffer: usize,

    /// Events dropped on full or closed buffers, for observability
    dropped: AtomicU64,
}

impl SubscriberRegistry {
    pub fn new(buffer: usize) -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(HashMap::new()),
            buffer: buffer.max(1),
            dropped: AtomicU64::new(0),
        })
    }

    /// Register a connection. Dropping the returned subscription
    /// unsubscribes it.
    pub fn subscribe(self: &Arc<Self>, identity: Identity) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = Uuid::new_v4();

        self.subscribers
            .lock()
            .expect("subscriber registry poisoned")
            .insert(id, Subscriber { identity, tx });

        debug!(subscription = %id, user = %identity.user_id, "Subscriber connected");

        Subscription {
            id,
            identity,
            rx,
            registry: Arc::downgrade(self),
        }
    }

    /// Deliver an event to every subscriber authorized for its scope.
    /// Never blocks; full or closed buffers lose the event.
    pub fn publish(&self, event: &StatusEvent) {
        let scope = event.scope();
        let mut closed = Vec::new();

        {
            let subscribers = self
                .subscribers
                .lock()
                .expect("subscriber registry poisoned");

            for (id, subscriber) in subscribers.iter() {
                if !subscriber.identity.authorizes(scope) {
                    continue;
                }

                match subscriber.tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        debug!(subscription = %id, "Subscriber buffer full, event dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        closed.push(*id);
                    }
                }
            }
        }

        if !closed.is_empty() {
            let mut subscribers = self
                .subscribers
                .lock()
                .expect("subscriber registry poisoned");
            for id in closed {
                subscribers.remove(&id);
            }
        }
    }

    fn unsubscribe(&self, id: Uuid) {
        self.subscribers
            .lock()
            .expect("subscriber registry poisoned")
            .remove(&id);
        debug!(subscription = %id, "Subscriber disconnected");
    }

    /// Number of live subscriptions.
    pub fn len(&self) -> usize {
        self.subscribers
            .lock()
            .expect("subscriber registry poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Events lost to full or closed buffers since startup.
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// One connection's live event feed.
pub struct Subscription {
    id: Uuid,
    pub identity: Identity,
    rx: mpsc::Receiver<StatusEvent>,
    registry: Weak<SubscriberRegistry>,
}

impl Subscription {
    /// Next event, or `None` once the registry is gone.
    pub async fn recv(&mut self) -> Option<StatusEvent> {
        self.rx.recv().await
    }

    /// Non-blocking read of a buffered event.
    pub fn try_recv(&mut self) -> Option<StatusEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event_for(scope: EventScope) -> StatusEvent {
        StatusEvent::ProcessingStatus {
            recording_id: Uuid::new_v4(),
            stage: "transcribing".into(),
            stage_version: 2,
            progress: None,
            scope,
        }
    }

    #[tokio::test]
    async fn owner_and_clinic_staff_receive_events() {
        let registry = SubscriberRegistry::new(8);

        let owner = Uuid::new_v4();
        let clinic = Uuid::new_v4();
        let scope = EventScope {
            owner_id: owner,
            clinic_id: clinic,
        };

        let mut owner_sub = registry.subscribe(Identity {
            user_id: owner,
            clinic_id: Uuid::new_v4(),
        });
        let mut staff_sub = registry.subscribe(Identity {
            user_id: Uuid::new_v4(),
            clinic_id: clinic,
        });
        let mut outsider_sub = registry.subscribe(Identity {
            user_id: Uuid::new_v4(),
            clinic_id: Uuid::new_v4(),
        });

        registry.publish(&event_for(scope));

        assert!(owner_sub.try_recv().is_some());
        assert!(staff_sub.try_recv().is_some());
        assert!(outsider_sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn full_buffer_drops_instead_of_blocking() {
        let registry = SubscriberRegistry::new(2);
        let scope = EventScope {
            owner_id: Uuid::new_v4(),
            clinic_id: Uuid::new_v4(),
        };

        let mut sub = registry.subscribe(Identity {
            user_id: scope.owner_id,
            clinic_id: scope.clinic_id,
        });

        for _ in 0..5 {
            registry.publish(&event_for(scope));
        }

        assert_eq!(registry.dropped_events(), 3);
        assert!(sub.try_recv().is_some());
        assert!(sub.try_recv().is_some());
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn drop_unsubscribes() {
        let registry = SubscriberRegistry::new(8);
        let sub = registry.subscribe(Identity {
            user_id: Uuid::new_v4(),
            clinic_id: Uuid::new_v4(),
        });

        assert_eq!(registry.len(), 1);
        drop(sub);
        assert_eq!(registry.len(), 0);
    }
}
