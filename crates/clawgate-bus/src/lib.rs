//! clawgate-bus: in-process publish/subscribe message bus.
//!
//! Decouples producers (channel adapters, the cron scheduler) from consumers
//! (the agent loop, channel delivery loops).
//!
//! # Architecture
//!
//! ```text
//! ChannelAdapter ──publish(session_key, In)──┐
//! CronService ─────publish(deliver:<ch>, Out)┤
//!                                            ▼
//!                                       MessageBus
//!                                            │ one bounded queue per subscriber
//!              ┌─────────────────────────────┴──────────────┐
//!   subscribe(Inbound)                          subscribe(Delivery(channel))
//!       AgentLoop                                    ChannelManager
//! ```
//!
//! Publishing never waits on a consumer. When a subscriber's queue is full the
//! oldest pending envelope is discarded and counted as a lost delivery.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use futures::Stream;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, warn};

use clawgate_types::{Direction, Envelope};

/// Prefix of the reserved delivery topics.
pub const DELIVERY_PREFIX: &str = "deliver:";

/// Reserved topic on which outbound envelopes for `channel` are published.
pub fn delivery_topic(channel: &str) -> String {
    format!("{DELIVERY_PREFIX}{channel}")
}

/// Selects which published envelopes a subscriber receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicFilter {
    /// Exactly one topic.
    Topic(String),
    /// Every inbound envelope, whatever its topic.
    Inbound,
    /// The delivery topic of one channel.
    Delivery(String),
}

impl TopicFilter {
    fn matches(&self, topic: &str, envelope: &Envelope) -> bool {
        match self {
            TopicFilter::Topic(t) => t == topic,
            TopicFilter::Inbound => envelope.direction == Direction::In,
            TopicFilter::Delivery(channel) => topic
                .strip_prefix(DELIVERY_PREFIX)
                .is_some_and(|c| c == channel),
        }
    }
}

/// Counters describing bus traffic since creation.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct BusStats {
    /// Calls to `publish`.
    pub published: u64,
    /// Envelope copies queued to subscribers.
    pub delivered: u64,
    /// Pending envelopes discarded because a subscriber queue was full.
    pub dropped: u64,
    /// Envelopes published with no matching subscriber.
    pub unrouted: u64,
    /// Currently registered subscribers.
    pub subscribers: usize,
}

struct Slot {
    id: u64,
    filter: TopicFilter,
    queue: Mutex<VecDeque<Envelope>>,
    notify: Notify,
    dropped: AtomicU64,
}

impl Slot {
    fn pop(&self) -> Option<Envelope> {
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }
}

struct BusInner {
    capacity: usize,
    subscribers: RwLock<Vec<Arc<Slot>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    unrouted: AtomicU64,
}

impl BusInner {
    fn wake_all(&self) {
        let subscribers = self.subscribers.read().unwrap_or_else(|e| e.into_inner());
        for slot in subscribers.iter() {
            slot.notify.notify_one();
        }
    }
}

impl Drop for BusInner {
    fn drop(&mut self) {
        self.wake_all();
    }
}

/// In-process message bus with bounded, drop-oldest subscriber queues.
///
/// Cloning is cheap; clones share the same subscribers.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    /// Create a bus whose subscribers each buffer up to `capacity` envelopes.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                capacity: capacity.max(1),
                subscribers: RwLock::new(Vec::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                published: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                unrouted: AtomicU64::new(0),
            }),
        }
    }

    /// Per-subscriber queue capacity.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Publish an envelope on `topic`.
    ///
    /// Never blocks. Returns the number of subscribers the envelope was queued to;
    /// zero means it was dropped for lack of a subscriber.
    pub fn publish(&self, topic: &str, envelope: Envelope) -> usize {
        let inner = &self.inner;
        inner.published.fetch_add(1, Ordering::Relaxed);

        if inner.closed.load(Ordering::Acquire) {
            debug!(topic, envelope_id = %envelope.id, "Bus closed, dropping envelope");
            inner.unrouted.fetch_add(1, Ordering::Relaxed);
            return 0;
        }

        let subscribers = inner.subscribers.read().unwrap_or_else(|e| e.into_inner());
        let mut routed = 0;
        for slot in subscribers
            .iter()
            .filter(|s| s.filter.matches(topic, &envelope))
        {
            {
                let mut queue = slot.queue.lock().unwrap_or_else(|e| e.into_inner());
                if queue.len() >= inner.capacity {
                    if let Some(lost) = queue.pop_front() {
                        slot.dropped.fetch_add(1, Ordering::Relaxed);
                        inner.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            topic,
                            subscriber = slot.id,
                            lost_envelope = %lost.id,
                            session = %lost.session_key,
                            "Subscriber queue full, dropped oldest envelope"
                        );
                    }
                }
                queue.push_back(envelope.clone());
            }
            slot.notify.notify_one();
            routed += 1;
        }

        if routed == 0 {
            inner.unrouted.fetch_add(1, Ordering::Relaxed);
            debug!(topic, envelope_id = %envelope.id, "No subscriber for topic, dropping envelope");
        } else {
            inner.delivered.fetch_add(routed as u64, Ordering::Relaxed);
        }
        routed
    }

    /// Register a subscriber. Dropping the returned `Subscription` unregisters it.
    pub fn subscribe(&self, filter: TopicFilter) -> Subscription {
        let slot = Arc::new(Slot {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            filter,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
        });
        debug!(subscriber = slot.id, filter = ?slot.filter, "Bus subscriber registered");
        self.inner
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(slot.clone());
        Subscription {
            slot,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Close the bus. Subscribers drain what is queued, then receive `None`.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.wake_all();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Snapshot of the traffic counters.
    pub fn stats(&self) -> BusStats {
        let inner = &self.inner;
        BusStats {
            published: inner.published.load(Ordering::Relaxed),
            delivered: inner.delivered.load(Ordering::Relaxed),
            dropped: inner.dropped.load(Ordering::Relaxed),
            unrouted: inner.unrouted.load(Ordering::Relaxed),
            subscribers: inner
                .subscribers
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .len(),
        }
    }
}

/// A subscriber's lazy view of the bus, FIFO per topic.
pub struct Subscription {
    slot: Arc<Slot>,
    bus: Weak<BusInner>,
}

impl Subscription {
    /// Wait for the next envelope. Returns `None` once the bus is closed (or gone)
    /// and this subscriber's queue is drained.
    pub async fn recv(&mut self) -> Option<Envelope> {
        loop {
            if let Some(envelope) = self.slot.pop() {
                return Some(envelope);
            }
            match self.bus.upgrade() {
                Some(bus) if !bus.closed.load(Ordering::Acquire) => {}
                _ => return None,
            }
            self.slot.notify.notified().await;
        }
    }

    /// Take the next envelope if one is queued.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.slot.pop()
    }

    /// Number of envelopes waiting in this subscriber's queue.
    pub fn pending(&self) -> usize {
        self.slot
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Envelopes this subscriber lost to backpressure.
    pub fn dropped(&self) -> u64 {
        self.slot.dropped.load(Ordering::Relaxed)
    }

    /// Convert into a `Stream` of envelopes.
    pub fn into_stream(self) -> impl Stream<Item = Envelope> + Send {
        futures::stream::unfold(self, |mut sub| async move {
            let envelope = sub.recv().await?;
            Some((envelope, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.subscribers
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .retain(|s| s.id != self.slot.id);
            debug!(subscriber = self.slot.id, "Bus subscriber removed");
        }
    }
}
