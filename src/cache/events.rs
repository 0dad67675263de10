//! Sync event system.
//!
//! Executors and the session monitor publish events here; collaborators
//! drain them to learn which keys became stale and when the session ended.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, gauge};
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use super::lock::mutex_lock;

const SOURCE: &str = "cache::events";

const METRIC_EVENT_QUEUE_LEN: &str = "studysync_event_queue_len";
const METRIC_EVENT_DROPPED: &str = "studysync_event_dropped_total";

const DEFAULT_QUEUE_LIMIT: NonZeroUsize = match NonZeroUsize::new(1024) {
    Some(limit) => limit,
    None => NonZeroUsize::MIN,
};

/// Monotonic epoch for ordering events within this process.
pub type Epoch = u64;

#[derive(Debug, Clone)]
pub struct CacheEvent {
    /// Unique identifier so consumers can de-duplicate.
    pub id: Uuid,
    pub epoch: Epoch,
    pub kind: EventKind,
    pub timestamp: OffsetDateTime,
}

impl CacheEvent {
    pub fn new(kind: EventKind, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            kind,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// Signals exposed to UI collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    /// A key was explicitly invalidated and must be refetched.
    Invalidated { key: String },
    /// A key was dropped to keep the store within capacity.
    Evicted { key: String },
    /// Every cached entry was dropped (sign-out).
    Cleared,
    /// The server rejected a session the client believed was valid.
    SessionExpired,
}

impl EventKind {
    /// The cache key this event refers to, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Invalidated { key } | Self::Evicted { key } => Some(key),
            Self::Cleared | Self::SessionExpired => None,
        }
    }
}

/// Bounded in-memory event queue.
///
/// When full, the oldest pending event is dropped to make room.
pub struct EventQueue {
    queue: Mutex<VecDeque<CacheEvent>>,
    epoch_counter: AtomicU64,
    limit: NonZeroUsize,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::new_with_limit(DEFAULT_QUEUE_LIMIT)
    }

    pub fn new_with_limit(limit: NonZeroUsize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            epoch_counter: AtomicU64::new(0),
            limit,
        }
    }

    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Publish an event to the queue.
    pub fn publish(&self, kind: EventKind) {
        let epoch = self.next_epoch();
        let event = CacheEvent::new(kind, epoch);

        info!(
            event_id = %event.id,
            event_epoch = event.epoch,
            event_kind = ?event.kind,
            "Sync event enqueued"
        );

        let mut queue = mutex_lock(&self.queue, SOURCE, "publish");
        while queue.len() >= self.limit.get() {
            if let Some(dropped) = queue.pop_front() {
                counter!(METRIC_EVENT_DROPPED).increment(1);
                warn!(
                    event_id = %dropped.id,
                    event_kind = ?dropped.kind,
                    "Sync event queue full, dropping oldest event"
                );
            }
        }
        queue.push_back(event);
        gauge!(METRIC_EVENT_QUEUE_LEN).set(queue.len() as f64);
    }

    /// Drain up to `limit` events in FIFO order.
    pub fn drain(&self, limit: usize) -> Vec<CacheEvent> {
        let mut queue = mutex_lock(&self.queue, SOURCE, "drain");
        let count = limit.min(queue.len());
        let drained = queue.drain(..count).collect();
        gauge!(METRIC_EVENT_QUEUE_LEN).set(queue.len() as f64);
        drained
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.queue, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        mutex_lock(&self.queue, SOURCE, "clear").clear();
        gauge!(METRIC_EVENT_QUEUE_LEN).set(0.0);
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
