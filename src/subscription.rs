//! # Topic Subscription Registry
//!
//! Binds local interest in a topic to delivery queues, decoupling the router
//! from application code.
//!
//! Each [`Subscription`] owns an independent bounded ring. The router pushes
//! into every ring for the topic without ever waiting: when a ring is full the
//! oldest undelivered item is discarded and the drop is counted, both on the
//! subscription and registry-wide. One slow consumer therefore never stalls
//! the router or starves another subscriber of the same topic.
//!
//! The ring is guarded by a `std::sync::Mutex` that is only held for a
//! push or pop, never across an `.await`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::identity::Identity;
use crate::messages::MessageId;

/// Default number of pending deliveries per subscription.
pub const DEFAULT_QUEUE_CAPACITY: usize = 128;

/// A message handed to a local subscriber.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delivery {
    pub message_id: MessageId,
    pub sender: Identity,
    pub topic: String,
    pub payload: Vec<u8>,
    /// The neighbour that relayed the message, or `None` for the node's own
    /// publishes.
    pub received_from: Option<Identity>,
}

impl Delivery {
    pub fn is_local(&self) -> bool {
        self.received_from.is_none()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct DeliveryQueue {
    id: u64,
    capacity: usize,
    items: Mutex<VecDeque<Delivery>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
}

impl DeliveryQueue {
    fn new(id: u64, capacity: usize) -> Self {
        Self {
            id,
            capacity: capacity.max(1),
            items: Mutex::new(VecDeque::with_capacity(capacity.max(1))),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        }
    }

    /// Returns whether the oldest item had to be evicted.
    fn push(&self, delivery: Delivery) -> bool {
        let evicted = {
            let mut items = lock(&self.items);
            let evicted = if items.len() >= self.capacity {
                items.pop_front();
                true
            } else {
                false
            };
            items.push_back(delivery);
            evicted
        };
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }

    fn pop(&self) -> Option<Delivery> {
        lock(&self.items).pop_front()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        lock(&self.items).clear();
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct RegistryState {
    topics: HashMap<String, Vec<Arc<DeliveryQueue>>>,
    next_id: u64,
}

struct RegistryInner {
    state: Mutex<RegistryState>,
    capacity: usize,
    dropped: AtomicU64,
}

/// Tracks which topics the local process listens on. Cheap to clone.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl SubscriptionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                state: Mutex::new(RegistryState::default()),
                capacity,
                dropped: AtomicU64::new(0),
            }),
        }
    }

    pub fn subscribe(&self, topic: &str) -> Subscription {
        let queue = {
            let mut state = lock(&self.inner.state);
            let id = state.next_id;
            state.next_id += 1;
            let queue = Arc::new(DeliveryQueue::new(id, self.inner.capacity));
            state
                .topics
                .entry(topic.to_string())
                .or_default()
                .push(queue.clone());
            queue
        };
        debug!(topic = %topic, "local subscriber added");
        Subscription {
            topic: topic.to_string(),
            queue,
            registry: self.clone(),
        }
    }

    /// Close every queue for `topic`. Pending items are discarded. Returns the
    /// number of queues closed.
    pub fn unsubscribe(&self, topic: &str) -> usize {
        let removed = lock(&self.inner.state).topics.remove(topic).unwrap_or_default();
        for queue in &removed {
            queue.close();
        }
        if !removed.is_empty() {
            debug!(topic = %topic, closed = removed.len(), "local subscribers closed");
        }
        removed.len()
    }

    /// Push `delivery` into every open queue of its topic. Never blocks.
    /// Returns how many queues received it.
    pub fn deliver(&self, delivery: &Delivery) -> usize {
        let queues: Vec<Arc<DeliveryQueue>> = lock(&self.inner.state)
            .topics
            .get(&delivery.topic)
            .cloned()
            .unwrap_or_default();

        let mut accepted = 0;
        for queue in queues.iter().filter(|q| !q.is_closed()) {
            if queue.push(delivery.clone()) {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(topic = %delivery.topic, "subscriber queue full, dropped oldest");
            }
            accepted += 1;
        }
        accepted
    }

    pub fn has_subscribers(&self, topic: &str) -> bool {
        lock(&self.inner.state)
            .topics
            .get(topic)
            .is_some_and(|queues| !queues.is_empty())
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        lock(&self.inner.state).topics.get(topic).map_or(0, Vec::len)
    }

    /// Deliveries evicted by queue overflow across all subscriptions.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    fn remove_queue(&self, topic: &str, id: u64) {
        let mut state = lock(&self.inner.state);
        if let Some(queues) = state.topics.get_mut(topic) {
            queues.retain(|q| q.id != id);
            if queues.is_empty() {
                state.topics.remove(topic);
            }
        }
    }
}

/// A local handle on one topic's delivery queue. Dropping it unsubscribes
/// this handle only.
pub struct Subscription {
    topic: String,
    queue: Arc<DeliveryQueue>,
    registry: SubscriptionRegistry,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Wait for the next delivery. Returns `None` once the subscription is
    /// closed.
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            let notified = self.queue.notify.notified();
            if self.queue.is_closed() {
                return None;
            }
            if let Some(delivery) = self.queue.pop() {
                return Some(delivery);
            }
            notified.await;
        }
    }

    pub fn try_recv(&mut self) -> Option<Delivery> {
        if self.queue.is_closed() {
            return None;
        }
        self.queue.pop()
    }

    /// Deliveries this subscription lost to overflow.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.queue.is_closed()
    }

    pub fn pending(&self) -> usize {
        lock(&self.queue.items).len()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.remove_queue(&self.topic, self.queue.id);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("topic", &self.topic)
            .field("pending", &self.pending())
            .field("dropped", &self.dropped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn delivery(topic: &str, n: u8) -> Delivery {
        Delivery {
            message_id: [n; 32],
            sender: Identity::from_bytes([1u8; 32]),
            topic: topic.to_string(),
            payload: vec![n],
            received_from: Some(Identity::from_bytes([2u8; 32])),
        }
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let registry = SubscriptionRegistry::new(4);
        let mut sub = registry.subscribe("t");

        for n in 0..6 {
            assert_eq!(registry.deliver(&delivery("t", n)), 1);
        }

        assert_eq!(sub.dropped(), 2);
        assert_eq!(registry.dropped(), 2);
        let received: Vec<u8> = std::iter::from_fn(|| sub.try_recv())
            .map(|d| d.payload[0])
            .collect();
        assert_eq!(received, vec![2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn default_capacity_is_128() {
        let registry = SubscriptionRegistry::default();
        let sub = registry.subscribe("t");
        for n in 0..=128u32 {
            registry.deliver(&delivery("t", n as u8));
        }
        assert_eq!(sub.pending(), DEFAULT_QUEUE_CAPACITY);
        assert_eq!(sub.dropped(), 1);
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_starve_another() {
        let registry = SubscriptionRegistry::new(2);
        let slow = registry.subscribe("t");
        let mut fast = registry.subscribe("t");

        for n in 0..5 {
            registry.deliver(&delivery("t", n));
            assert_eq!(fast.recv().await.unwrap().payload, vec![n]);
        }
        assert_eq!(fast.dropped(), 0);
        assert_eq!(slow.dropped(), 3);
    }

    #[tokio::test]
    async fn deliver_to_other_topic_is_ignored() {
        let registry = SubscriptionRegistry::default();
        let mut sub = registry.subscribe("a");
        assert_eq!(registry.deliver(&delivery("b", 1)), 0);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn unsubscribe_closes_and_discards() {
        let registry = SubscriptionRegistry::default();
        let mut sub = registry.subscribe("t");
        registry.deliver(&delivery("t", 1));

        assert_eq!(registry.unsubscribe("t"), 1);
        assert!(sub.is_closed());
        assert_eq!(sub.recv().await, None);
        assert_eq!(registry.deliver(&delivery("t", 2)), 0);
        assert_eq!(registry.unsubscribe("t"), 0);
    }

    #[tokio::test]
    async fn recv_wakes_on_delivery_and_close() {
        let registry = SubscriptionRegistry::default();
        let mut sub = registry.subscribe("t");

        let pusher = registry.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            pusher.deliver(&delivery("t", 9));
            tokio::time::sleep(Duration::from_millis(20)).await;
            pusher.unsubscribe("t");
        });

        let first = tokio::time::timeout(Duration::from_secs(2), sub.recv()).await.unwrap();
        assert_eq!(first.unwrap().payload, vec![9]);
        let closed = tokio::time::timeout(Duration::from_secs(2), sub.recv()).await.unwrap();
        assert!(closed.is_none());
    }

    #[test]
    fn dropping_subscription_removes_only_its_queue() {
        let registry = SubscriptionRegistry::default();
        let first = registry.subscribe("t");
        let second = registry.subscribe("t");
        assert_eq!(registry.subscriber_count("t"), 2);

        drop(first);
        assert_eq!(registry.subscriber_count("t"), 1);
        drop(second);
        assert!(!registry.has_subscribers("t"));
    }
}
