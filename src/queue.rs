//! Bounded FIFO queue between event producers and the publish worker.
//!
//! Producers push without ever waiting; the single consumer waits for the
//! next event with a timeout. What happens when the queue is full is decided
//! once, at construction, by an [`OverflowPolicy`].

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::warn;

use crate::event::Event;

/// Default maximum number of queued events.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Behavior of `push` on a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Refuse the new event; `push` returns `false`
    #[default]
    Reject,

    /// Evict the oldest queued event to make room for the new one
    DropOldest,
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(OverflowPolicy::Reject),
            "drop-oldest" | "drop_oldest" => Ok(OverflowPolicy::DropOldest),
            other => Err(format!(
                "'{}' is not a valid overflow policy (expected 'reject' or 'drop-oldest')",
                other
            )),
        }
    }
}

impl std::fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OverflowPolicy::Reject => write!(f, "reject"),
            OverflowPolicy::DropOldest => write!(f, "drop-oldest"),
        }
    }
}

/// Configuration for the publish queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum number of events held at once
    pub capacity: usize,

    /// What to do when an event arrives at a full queue
    pub overflow: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            overflow: OverflowPolicy::default(),
        }
    }
}

impl QueueConfig {
    pub fn new(capacity: usize, overflow: OverflowPolicy) -> Self {
        Self {
            capacity: capacity.max(1),
            overflow,
        }
    }
}

/// Counters describing queue activity.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Events accepted by `push`
    pub enqueued: u64,

    /// Events refused because the queue was full
    pub rejected: u64,

    /// Queued events evicted to make room for newer ones
    pub dropped: u64,
}

/// Thread-safe bounded FIFO of events awaiting publish.
pub struct PublishQueue {
    items: Mutex<VecDeque<Event>>,
    available: Notify,
    config: QueueConfig,
    enqueued: AtomicU64,
    rejected: AtomicU64,
    dropped: AtomicU64,
}

impl PublishQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(config.capacity.min(1024))),
            available: Notify::new(),
            config,
            enqueued: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(QueueConfig::default())
    }

    /// Append an event without waiting.
    ///
    /// Returns `false` only when the queue is full under [`OverflowPolicy::Reject`].
    pub fn push(&self, event: Event) -> bool {
        {
            let mut items = self.items.lock();
            if items.len() >= self.config.capacity {
                match self.config.overflow {
                    OverflowPolicy::Reject => {
                        self.rejected.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            capacity = self.config.capacity,
                            event_id = event.id,
                            "Publish queue full, rejecting event"
                        );
                        return false;
                    }
                    OverflowPolicy::DropOldest => {
                        if let Some(evicted) = items.pop_front() {
                            self.dropped.fetch_add(1, Ordering::Relaxed);
                            warn!(
                                capacity = self.config.capacity,
                                evicted_id = evicted.id,
                                "Publish queue full, dropping oldest event"
                            );
                        }
                    }
                }
            }
            items.push_back(event);
        }

        self.enqueued.fetch_add(1, Ordering::Relaxed);
        self.available.notify_one();
        true
    }

    /// Remove the oldest event, if any.
    pub fn try_pop(&self) -> Option<Event> {
        self.items.lock().pop_front()
    }

    /// Wait up to `timeout` for the oldest event.
    ///
    /// Cancel safe: an event is only removed when this returns it.
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<Event> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(event) = self.try_pop() {
                return Some(event);
            }
            if tokio::time::timeout_at(deadline, self.available.notified())
                .await
                .is_err()
            {
                return self.try_pop();
            }
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for PublishQueue {
    fn default() -> Self {
        Self::with_defaults()
    }
}
