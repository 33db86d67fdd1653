//! Invalidation event queue.
//!
//! Decorated operations publish an event after each successful upstream
//! call; the invalidator consumes them to keep cached state consistent.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use time::OffsetDateTime;
use tracing::info;
use uuid::Uuid;

use crate::config::OperationKind;
use crate::entity::EntityId;
use crate::lock::mutex_lock;

const SOURCE: &str = "events";

/// Position of an event in this process's publish order.
pub type Epoch = u64;

/// One successful operation against an entity type.
#[derive(Debug, Clone)]
pub struct CacheEvent {
    /// Identifier the consumer dedupes on (UUIDv4).
    pub id: Uuid,
    /// Position in publish order.
    pub epoch: Epoch,
    /// Entity type the operation ran against.
    pub entity_type: String,
    /// What the operation did.
    pub kind: OperationKind,
    /// Identity of the affected record, when the operation names one.
    pub entity_id: Option<EntityId>,
    pub timestamp: OffsetDateTime,
}

impl CacheEvent {
    pub fn new(
        entity_type: impl Into<String>,
        kind: OperationKind,
        entity_id: Option<EntityId>,
        epoch: Epoch,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            entity_type: entity_type.into(),
            kind,
            entity_id,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

/// FIFO queue between decorated operations and the invalidator.
///
/// A plain mutex is enough here: writers enqueue one event per operation
/// and the invalidator takes them out in batches, so the lock is held for
/// moments at a time.
pub struct EventQueue {
    queue: Mutex<VecDeque<CacheEvent>>,
    epoch_counter: AtomicU64,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            epoch_counter: AtomicU64::new(0),
        }
    }

    /// Enqueue an event for the given operation, stamping the next epoch.
    pub fn publish(&self, entity_type: &str, kind: OperationKind, entity_id: Option<EntityId>) {
        let epoch = self.epoch_counter.fetch_add(1, Ordering::SeqCst);
        let event = CacheEvent::new(entity_type, kind, entity_id, epoch);

        info!(
            event_id = %event.id,
            event_epoch = event.epoch,
            entity_type,
            kind = %kind,
            "Invalidation event published"
        );

        mutex_lock(&self.queue, SOURCE, "publish").push_back(event);
    }

    /// Take up to `limit` events off the queue, oldest first.
    pub fn drain(&self, limit: usize) -> Vec<CacheEvent> {
        let mut queue = mutex_lock(&self.queue, SOURCE, "drain");
        let count = limit.min(queue.len());
        queue.drain(..count).collect()
    }

    /// Events currently waiting to be consumed.
    pub fn len(&self) -> usize {
        mutex_lock(&self.queue, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard every pending event without consuming it.
    pub fn clear(&self) {
        mutex_lock(&self.queue, SOURCE, "clear").clear();
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
