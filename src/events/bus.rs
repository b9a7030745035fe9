//! Event Bus (C6): in-process publish/subscribe with per-subscriber bounded
//! queues, topic filtering, and slow-subscriber disconnection.
//!
//! Delivery for one `publish` call is performed inline while holding each
//! subscriber's map shard, which is what gives this bus its ordering
//! guarantee (single dispatcher, spec §4.6) without a background task: two
//! concurrent `publish` calls on overlapping subscribers serialize through
//! `DashMap`'s per-shard lock, and `unsubscribe` cannot return until any
//! `publish` iteration already touching that subscriber's shard has
//! finished — so "after unsubscribe returns, no further deliveries" holds.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

pub use crate::events::payload::{Event, EventPayload};

/// Two consecutive overflows inside this window evict the subscriber.
const EVICTION_WINDOW: Duration = Duration::from_secs(5);

/// What topics a subscriber wants to see.
#[derive(Debug, Clone)]
pub enum TopicFilter {
    All,
    Exact(String),
    Prefix(String),
}

impl TopicFilter {
    fn matches(&self, topic: &str) -> bool {
        match self {
            TopicFilter::All => true,
            TopicFilter::Exact(t) => t == topic,
            TopicFilter::Prefix(p) => topic.starts_with(p.as_str()),
        }
    }
}

#[derive(Default)]
struct OverflowState {
    count: u8,
    first_at: Option<Instant>,
}

impl OverflowState {
    /// Records an overflow; returns true if this subscriber should now be evicted.
    fn record(&mut self) -> bool {
        let now = Instant::now();
        match self.first_at {
            Some(first) if now.duration_since(first) <= EVICTION_WINDOW => {
                self.count += 1;
            }
            _ => {
                self.count = 1;
                self.first_at = Some(now);
            }
        }
        self.count >= 2
    }

    fn clear(&mut self) {
        self.count = 0;
        self.first_at = None;
    }
}

struct Subscriber {
    filter: TopicFilter,
    sender: mpsc::Sender<Event>,
    overflow: Mutex<OverflowState>,
}

/// A handle returned from `subscribe`; drop or call `EventBus::unsubscribe`
/// to stop receiving.
pub struct Subscription {
    pub id: Uuid,
    pub receiver: mpsc::Receiver<Event>,
}

/// In-process publish/subscribe bus. Cloning shares the same subscriber
/// table (cheap — it's an `Arc`-backed `DashMap` underneath).
#[derive(Clone)]
pub struct EventBus {
    subscribers: std::sync::Arc<DashMap<Uuid, Subscriber>>,
    published: std::sync::Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: std::sync::Arc::new(DashMap::new()),
            published: std::sync::Arc::new(AtomicU64::new(0)),
        }
    }

    /// Registers a subscriber with a topic filter and bounded queue capacity.
    pub fn subscribe(&self, filter: TopicFilter, queue_capacity: usize) -> Subscription {
        let id = Uuid::new_v4();
        let (sender, receiver) = mpsc::channel(queue_capacity.max(1));
        self.subscribers.insert(
            id,
            Subscriber {
                filter,
                sender,
                overflow: Mutex::new(OverflowState::default()),
            },
        );
        debug!("subscriber {} registered", id);
        Subscription { id, receiver }
    }

    /// Synchronous unsubscribe: after this returns, no further deliveries to
    /// `id` occur.
    pub fn unsubscribe(&self, id: Uuid) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Publishes an event to all matching subscribers. Best-effort,
    /// at-most-once, FIFO within a topic. Returns the number of subscribers
    /// the event was delivered to.
    pub fn publish(&self, payload: EventPayload) -> usize {
        self.publish_event(Event::new(payload))
    }

    fn publish_event(&self, event: Event) -> usize {
        self.published.fetch_add(1, Ordering::Relaxed);

        let mut delivered = 0;
        let mut to_evict = Vec::new();

        for entry in self.subscribers.iter() {
            let sub = entry.value();
            if !sub.filter.matches(&event.topic) {
                continue;
            }
            match sub.sender.try_send(event.clone()) {
                Ok(()) => {
                    delivered += 1;
                    sub.overflow.lock().clear();
                }
                Err(_) => {
                    if sub.overflow.lock().record() {
                        to_evict.push(*entry.key());
                    }
                }
            }
        }

        for id in &to_evict {
            self.subscribers.remove(id);
            warn!("subscriber {} evicted: slow consumer", id);
        }
        // Published outside the iteration above to avoid re-entering DashMap
        // shard locks while they may still be held by the loop.
        for id in to_evict {
            self.publish_event(Event::new(EventPayload::SubscriberEvicted {
                subscription_id: id,
                reason: "slow_subscriber".to_string(),
            }));
        }

        delivered
    }

    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
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
    use crate::model::{JobState, RiskLevel};

    fn sample_event(container_id: i64) -> EventPayload {
        EventPayload::UpdateAvailable {
            container_id,
            from_digest: "sha256:a".into(),
            to_digest: "sha256:b".into(),
            risk_level: RiskLevel::Low,
            security_flag: false,
        }
    }

    #[tokio::test]
    async fn delivers_to_matching_subscriber() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(TopicFilter::Exact("container.42".into()), 8);

        bus.publish(sample_event(42));
        let event = sub.receiver.recv().await.unwrap();
        assert_eq!(event.topic, "container.42");
    }

    #[tokio::test]
    async fn does_not_deliver_to_non_matching_subscriber() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(TopicFilter::Exact("container.1".into()), 8);

        bus.publish(sample_event(42));
        // Publish something that does match so recv() doesn't hang forever.
        bus.publish(sample_event(1));
        let event = sub.receiver.recv().await.unwrap();
        assert_eq!(event.topic, "container.1");
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let sub = bus.subscribe(TopicFilter::All, 8);
        let id = sub.id;
        drop(sub);

        assert!(bus.unsubscribe(id));
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.publish(sample_event(1)), 0);
    }

    #[tokio::test]
    async fn slow_subscriber_evicted_after_two_overflows() {
        let bus = EventBus::new();
        let sub = bus.subscribe(TopicFilter::All, 1);

        // Fill the queue (capacity 1) then overflow it twice in a row.
        bus.publish(sample_event(1));
        bus.publish(sample_event(1)); // overflow #1
        bus.publish(sample_event(1)); // overflow #2 -> evicted

        assert_eq!(bus.subscriber_count(), 0);
        drop(sub);
    }

    #[tokio::test]
    async fn job_state_event_topic_is_per_job() {
        let bus = EventBus::new();
        let job_id = uuid::Uuid::new_v4();
        let mut sub = bus.subscribe(TopicFilter::Prefix("job.".into()), 8);

        bus.publish(EventPayload::JobTerminal {
            job_id,
            state: JobState::Succeeded,
            error_kind: None,
            error_message: None,
        });

        let event = sub.receiver.recv().await.unwrap();
        assert_eq!(event.topic, format!("job.{}", job_id));
    }
}
