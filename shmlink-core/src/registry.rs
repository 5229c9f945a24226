// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Thread-safe subscriber registry using DashMap.
//!
//! Maps subscriber identities to change callbacks and fans out change
//! notifications. Liveness is discovered at delivery time: a subscriber whose
//! callback fails is pruned and not retried that round.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::error::DeliveryError;
use crate::types::SubscriberId;

/// Notification delivered to subscribers. Carries no payload; recipients read
/// the segment to fetch the current contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A new frame was written.
    DataChanged,
    /// Re-sync requested without a new write.
    Resync,
}

impl ChangeEvent {
    pub const fn name(&self) -> &'static str {
        match self {
            Self::DataChanged => "DataChanged",
            Self::Resync => "Resync",
        }
    }
}

/// Receiver of change notifications.
///
/// Returning an error marks the subscriber dead; the registry drops it.
pub trait DataChangedCallback: Send + Sync {
    fn on_data_changed(&self, event: ChangeEvent) -> Result<(), DeliveryError>;
}

impl<F> DataChangedCallback for F
where
    F: Fn(ChangeEvent) -> Result<(), DeliveryError> + Send + Sync,
{
    fn on_data_changed(&self, event: ChangeEvent) -> Result<(), DeliveryError> {
        self(event)
    }
}

struct Registration {
    callback: Arc<dyn DataChangedCallback>,
    /// Distinguishes re-registrations under the same id during a broadcast.
    token: u64,
}

/// Outcome of one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Subscribers whose callback returned Ok.
    pub delivered: usize,
    /// Subscribers removed because delivery failed.
    pub pruned: Vec<SubscriberId>,
}

/// Thread-safe registry of change subscribers.
/// Uses DashMap for concurrent registration while broadcasts are in flight.
pub struct SubscriberRegistry {
    subscribers: DashMap<SubscriberId, Registration>,
    next_token: AtomicU64,
}

impl SubscriberRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
            next_token: AtomicU64::new(0),
        }
    }

    /// Register `callback` under `id`.
    ///
    /// Returns false if `id` is already registered; the existing
    /// registration is kept.
    pub fn subscribe(&self, id: SubscriberId, callback: Arc<dyn DataChangedCallback>) -> bool {
        match self.subscribers.entry(id) {
            Entry::Occupied(entry) => {
                tracing::debug!(subscriber = %entry.key(), "Subscriber already registered");
                false
            }
            Entry::Vacant(entry) => {
                tracing::debug!(subscriber = %entry.key(), "Subscriber registered");
                let token = self.next_token.fetch_add(1, Ordering::Relaxed);
                entry.insert(Registration { callback, token });
                true
            }
        }
    }

    /// Remove the registration for `id`. Returns false if absent.
    pub fn unsubscribe(&self, id: &SubscriberId) -> bool {
        let removed = self.subscribers.remove(id).is_some();
        if removed {
            tracing::debug!(subscriber = %id, "Subscriber unregistered");
        }
        removed
    }

    /// Deliver `event` to every registered subscriber.
    ///
    /// Iterates a snapshot, so subscribe/unsubscribe may run concurrently.
    /// Delivery order is unspecified. Failures are logged, the failing
    /// subscriber is pruned, and the broadcast carries on.
    pub fn broadcast(&self, event: ChangeEvent) -> BroadcastReport {
        let snapshot: Vec<(SubscriberId, Arc<dyn DataChangedCallback>, u64)> = self
            .subscribers
            .iter()
            .map(|r| (r.key().clone(), Arc::clone(&r.callback), r.token))
            .collect();

        tracing::debug!(
            event = event.name(),
            subscribers = snapshot.len(),
            "Broadcasting change"
        );

        let mut report = BroadcastReport::default();
        for (id, callback, token) in snapshot {
            match callback.on_data_changed(event) {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    tracing::warn!(subscriber = %id, error = %e, "Pruning dead subscriber");
                    // Only drop the registration that failed, not a newer one.
                    if self
                        .subscribers
                        .remove_if(&id, |_, r| r.token == token)
                        .is_some()
                    {
                        report.pruned.push(id);
                    }
                }
            }
        }

        report
    }

    /// Check if a subscriber is registered.
    pub fn contains(&self, id: &SubscriberId) -> bool {
        self.subscribers.contains_key(id)
    }

    /// Get the number of registered subscribers. Diagnostics only.
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Get a list of all subscriber IDs.
    pub fn subscriber_ids(&self) -> Vec<SubscriberId> {
        self.subscribers.iter().map(|r| r.key().clone()).collect()
    }

    /// Drop every registration without notifying anyone.
    pub fn clear(&self) {
        self.subscribers.clear();
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("subscribers", &self.subscriber_ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::thread;

    fn id(name: &str) -> SubscriberId {
        SubscriberId::new(name).unwrap()
    }

    struct Counting {
        hits: AtomicUsize,
        dead: AtomicBool,
    }

    impl Counting {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                hits: AtomicUsize::new(0),
                dead: AtomicBool::new(false),
            })
        }

        fn hits(&self) -> usize {
            self.hits.load(Ordering::SeqCst)
        }
    }

    impl DataChangedCallback for Counting {
        fn on_data_changed(&self, _event: ChangeEvent) -> Result<(), DeliveryError> {
            if self.dead.load(Ordering::SeqCst) {
                return Err(DeliveryError::Failed {
                    reason: "peer gone".to_string(),
                });
            }
            self.hits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_subscribe_and_unsubscribe() {
        let registry = SubscriberRegistry::new();
        let cb = Counting::new();

        assert!(registry.subscribe(id("a"), cb.clone()));
        assert!(registry.contains(&id("a")));
        assert_eq!(registry.len(), 1);

        assert!(registry.unsubscribe(&id("a")));
        assert!(!registry.unsubscribe(&id("a")));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_subscribe_is_single_registration() {
        let registry = SubscriberRegistry::new();
        let cb = Counting::new();

        assert!(registry.subscribe(id("a"), cb.clone()));
        assert!(!registry.subscribe(id("a"), cb.clone()));
        assert_eq!(registry.len(), 1);

        registry.broadcast(ChangeEvent::DataChanged);
        assert_eq!(cb.hits(), 1);
    }

    #[test]
    fn test_unknown_unsubscribe_keeps_others() {
        let registry = SubscriberRegistry::new();
        registry.subscribe(id("a"), Counting::new());
        assert!(!registry.unsubscribe(&id("missing")));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_broadcast_prunes_failed_subscriber() {
        let registry = SubscriberRegistry::new();
        let callbacks: Vec<_> = (0..3).map(|_| Counting::new()).collect();
        for (i, cb) in callbacks.iter().enumerate() {
            registry.subscribe(id(&format!("sub-{}", i)), cb.clone());
        }

        let report = registry.broadcast(ChangeEvent::DataChanged);
        assert_eq!(report.delivered, 3);
        assert!(report.pruned.is_empty());

        callbacks[1].dead.store(true, Ordering::SeqCst);
        let report = registry.broadcast(ChangeEvent::DataChanged);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.pruned, vec![id("sub-1")]);
        assert_eq!(registry.len(), 2);

        let report = registry.broadcast(ChangeEvent::DataChanged);
        assert_eq!(report.delivered, 2);
        assert_eq!(callbacks[0].hits(), 3);
        assert_eq!(callbacks[1].hits(), 1);
        assert_eq!(callbacks[2].hits(), 3);
    }

    #[test]
    fn test_closure_callback() {
        let registry = SubscriberRegistry::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_cb = Arc::clone(&seen);
        registry.subscribe(
            id("closure"),
            Arc::new(move |event: ChangeEvent| -> Result<(), DeliveryError> {
                assert_eq!(event, ChangeEvent::Resync);
                seen_cb.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        registry.broadcast(ChangeEvent::Resync);
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_callback_may_mutate_registry() {
        let registry = Arc::new(SubscriberRegistry::new());
        let inner = Arc::clone(&registry);
        registry.subscribe(
            id("self-removing"),
            Arc::new(move |_event: ChangeEvent| -> Result<(), DeliveryError> {
                inner.unsubscribe(&SubscriberId::new("self-removing").unwrap());
                inner.subscribe(SubscriberId::new("late").unwrap(), Counting::new());
                Ok(())
            }),
        );

        let report = registry.broadcast(ChangeEvent::DataChanged);
        assert_eq!(report.delivered, 1);
        assert!(!registry.contains(&id("self-removing")));
        assert!(registry.contains(&id("late")));
    }

    #[test]
    fn test_clear() {
        let registry = SubscriberRegistry::new();
        let cb = Counting::new();
        registry.subscribe(id("a"), cb.clone());
        registry.subscribe(id("b"), Counting::new());
        registry.clear();
        assert!(registry.is_empty());
        registry.broadcast(ChangeEvent::DataChanged);
        assert_eq!(cb.hits(), 0);
    }

    #[test]
    fn test_concurrent_access() {
        let registry = Arc::new(SubscriberRegistry::new());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let reg = Arc::clone(&registry);
                thread::spawn(move || {
                    for j in 0..50 {
                        let sub = SubscriberId::new(format!("t{}-{}", i, j)).unwrap();
                        reg.subscribe(sub.clone(), Counting::new());
                        reg.broadcast(ChangeEvent::DataChanged);
                        if j % 2 == 0 {
                            reg.unsubscribe(&sub);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.len(), 8 * 25);
    }
}
