//! Event Bus (C1, spec §4.1): in-process typed publish/subscribe.
//!
//! A shared `tokio::sync::broadcast` ring is insufficient alone — it
//! drops oldest on one ring shared by every subscriber, so one lagging
//! subscriber evicts events another subscriber hasn't read yet. Instead
//! each `subscribe()` call gets its own bounded ring, so a lagging
//! consumer only ever costs itself history. Overflow emits
//! `SubscriberLagged { subscriber_id, dropped_count }` on that
//! subscriber's own queue, delivered right before the next event that
//! successfully fits.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arena_domain::event::Event;
use parking_lot::Mutex;
use tokio::sync::Notify;

struct Ring {
    queue: Mutex<VecDeque<Event>>,
    dropped_pending: Mutex<u64>,
    capacity: usize,
    notify: Notify,
}

impl Ring {
    fn push(&self, event: Event, subscriber_id: u64) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            queue.pop_front();
            *self.dropped_pending.lock() += 1;
        }
        queue.push_back(event);

        let mut dropped = self.dropped_pending.lock();
        if *dropped > 0 {
            if queue.len() >= self.capacity {
                queue.pop_front();
            }
            queue.push_back(Event::SubscriberLagged {
                subscriber_id,
                dropped_count: *dropped,
            });
            *dropped = 0;
        }
        drop(queue);
        self.notify.notify_one();
    }
}

struct Subscriber {
    id: u64,
    ring: Arc<Ring>,
}

/// Constructed once at engine start and passed explicitly to every
/// component that needs to publish or subscribe (spec §9: no global
/// singletons).
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
    default_capacity: usize,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            default_capacity,
        }
    }

    /// Register before scheduler start (spec §4.1 contract). Returns a
    /// receiver with its own bounded ring of `capacity` events (falls
    /// back to the bus's default capacity when `None`).
    pub fn subscribe(&self, capacity: Option<usize>) -> EventReceiver {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let ring = Arc::new(Ring {
            queue: Mutex::new(VecDeque::new()),
            dropped_pending: Mutex::new(0),
            capacity: capacity.unwrap_or(self.default_capacity),
            notify: Notify::new(),
        });
        self.subscribers.lock().push(Subscriber {
            id,
            ring: ring.clone(),
        });
        EventReceiver { id, ring }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.lock().retain(|s| s.id != id);
    }

    /// Fan out to every subscriber. Delivery is at-least-once within
    /// process, ordered per publisher call site, best-effort across
    /// publishers (spec §4.1). Never blocks: a full ring drops its own
    /// oldest entry rather than back-pressuring the caller.
    pub fn publish(&self, event: Event) {
        event.emit_trace();
        let subscribers = self.subscribers.lock();
        for sub in subscribers.iter() {
            sub.ring.push(event.clone(), sub.id);
        }
    }
}

/// A single subscriber's view of the bus. `recv()` is cancellation-safe
/// (it can be used inside `tokio::select!`) since it only awaits a
/// `Notify` and then drains whatever is queued.
pub struct EventReceiver {
    id: u64,
    ring: Arc<Ring>,
}

impl EventReceiver {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub async fn recv(&mut self) -> Event {
        loop {
            if let Some(event) = self.ring.queue.lock().pop_front() {
                return event;
            }
            self.ring.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.ring.queue.lock().pop_front()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_started(id: &str) -> Event {
        Event::RunStarted { run_id: id.into() }
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe(None);
        bus.publish(run_started("r1"));
        let event = rx.recv().await;
        assert!(matches!(event, Event::RunStarted { run_id } if run_id == "r1"));
    }

    #[tokio::test]
    async fn multiple_subscribers_each_receive_independently() {
        let bus = EventBus::new(8);
        let mut rx1 = bus.subscribe(None);
        let mut rx2 = bus.subscribe(None);
        bus.publish(run_started("r1"));
        assert!(matches!(rx1.recv().await, Event::RunStarted { .. }));
        assert!(matches!(rx2.recv().await, Event::RunStarted { .. }));
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_emits_subscriber_lagged() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe(None);
        bus.publish(run_started("r1"));
        bus.publish(run_started("r2"));
        bus.publish(run_started("r3")); // overflows: drops r1, appends lag marker

        let first = rx.try_recv().unwrap();
        assert!(matches!(first, Event::RunStarted { run_id } if run_id == "r2"));
        let second = rx.try_recv().unwrap();
        assert!(matches!(second, Event::SubscriberLagged { dropped_count: 1, .. }));
        let third = rx.try_recv().unwrap();
        assert!(matches!(third, Event::RunStarted { run_id } if run_id == "r3"));
    }

    #[tokio::test]
    async fn a_slow_subscriber_does_not_affect_a_fast_one() {
        let bus = EventBus::new(1);
        let mut slow = bus.subscribe(Some(1));
        let mut fast = bus.subscribe(Some(8));
        for i in 0..5 {
            bus.publish(run_started(&format!("r{i}")));
        }
        // fast subscriber's ring is large enough to hold everything.
        let mut fast_count = 0;
        while fast.try_recv().is_some() {
            fast_count += 1;
        }
        assert_eq!(fast_count, 5);
        assert!(slow.try_recv().is_some());
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new(8);
        let rx = bus.subscribe(None);
        let id = rx.id();
        bus.unsubscribe(id);
        bus.publish(run_started("r1"));
        assert_eq!(bus.subscribers.lock().len(), 0);
    }
}
