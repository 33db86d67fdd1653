//! Entity record storage.
//!
//! One bounded LRU map per declared entity type, holding the last known
//! value of each record as JSON. The set of types is fixed at
//! construction; writes against undeclared types are rejected.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use lru::LruCache;
use metrics::counter;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::config::{CacheSettings, EntityRegistry};
use crate::entity::{CacheEntity, EntityId};
use crate::error::CacheError;
use crate::lock::{rw_read, rw_write};

const SOURCE: &str = "store";

const METRIC_ENTITY_HIT_TOTAL: &str = "dispensa_entity_hit_total";
const METRIC_ENTITY_MISS_TOTAL: &str = "dispensa_entity_miss_total";
const METRIC_ENTITY_EVICT_TOTAL: &str = "dispensa_entity_evict_total";

/// The last known value of one entity, with its freshness stamp.
#[derive(Debug, Clone)]
pub struct EntityRecord {
    pub id: EntityId,
    pub value: Value,
    /// Deadline after which the record is stale. `None` means the record
    /// stays until explicitly invalidated.
    pub expires_at: Option<Instant>,
}

impl EntityRecord {
    /// Whether the record is still fresh at `now`.
    pub fn is_fresh(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| now < deadline)
    }
}

struct TypeSlot {
    ttl: Option<Duration>,
    records: RwLock<LruCache<EntityId, EntityRecord>>,
}

/// In-memory record store for every configured entity type.
///
/// At most one record exists per `(entity_type, id)` pair; the latest
/// successful write wins. Expired records are dropped when observed.
pub struct EntityStore {
    slots: HashMap<String, TypeSlot>,
}

impl EntityStore {
    /// Create a store with one bounded map per type in the registry.
    pub fn new(registry: &EntityRegistry, settings: &CacheSettings) -> Self {
        let mut slots = HashMap::new();
        for name in registry.names() {
            slots.insert(
                name.to_string(),
                TypeSlot {
                    ttl: registry.ttl(name),
                    records: RwLock::new(LruCache::new(settings.entity_limit_non_zero())),
                },
            );
        }
        Self { slots }
    }

    fn slot(&self, entity_type: &str) -> Result<&TypeSlot, CacheError> {
        self.slots
            .get(entity_type)
            .ok_or_else(|| CacheError::unknown_entity_type(entity_type))
    }

    /// Store a payload under the id it carries, stamping the type's ttl.
    ///
    /// Returns the stored record. An existing record with the same id is
    /// overwritten.
    pub fn put<T>(&self, entity_type: &str, value: &T) -> Result<EntityRecord, CacheError>
    where
        T: CacheEntity + Serialize,
    {
        let id = value
            .entity_id()
            .ok_or_else(|| CacheError::invalid_entity(entity_type))?;
        let encoded = serde_json::to_value(value).map_err(CacheError::encode)?;
        self.insert(entity_type, id, encoded)
    }

    /// Untyped variant of [`EntityStore::put`]; the id comes from the
    /// value's `"id"` field.
    pub fn put_value(&self, entity_type: &str, value: Value) -> Result<EntityRecord, CacheError> {
        let id = value
            .entity_id()
            .ok_or_else(|| CacheError::invalid_entity(entity_type))?;
        self.insert(entity_type, id, value)
    }

    fn insert(
        &self,
        entity_type: &str,
        id: EntityId,
        value: Value,
    ) -> Result<EntityRecord, CacheError> {
        let slot = self.slot(entity_type)?;
        let record = EntityRecord {
            id: id.clone(),
            value,
            expires_at: slot.ttl.map(|ttl| Instant::now() + ttl),
        };

        let mut records = rw_write(&slot.records, SOURCE, "put");
        if let Some((evicted_id, _)) = records.push(id, record.clone())
            && evicted_id != record.id
        {
            counter!(METRIC_ENTITY_EVICT_TOTAL).increment(1);
            debug!(entity_type, evicted = %evicted_id, "entity record evicted at capacity");
        }

        Ok(record)
    }

    /// Fresh record for the id, when one is cached.
    ///
    /// An expired record is removed on observation and reported as a miss.
    pub fn get(&self, entity_type: &str, id: &EntityId) -> Option<EntityRecord> {
        let slot = self.slots.get(entity_type)?;
        let mut records = rw_write(&slot.records, SOURCE, "get");

        let now = Instant::now();
        match records.get(id).cloned() {
            Some(record) if record.is_fresh(now) => {
                counter!(METRIC_ENTITY_HIT_TOTAL).increment(1);
                Some(record)
            }
            Some(_) => {
                records.pop(id);
                counter!(METRIC_ENTITY_MISS_TOTAL).increment(1);
                debug!(entity_type, id = %id, "expired entity record dropped");
                None
            }
            None => {
                counter!(METRIC_ENTITY_MISS_TOTAL).increment(1);
                None
            }
        }
    }

    /// Remove one record. Missing ids and undeclared types are no-ops.
    pub fn remove(&self, entity_type: &str, id: &EntityId) {
        if let Some(slot) = self.slots.get(entity_type) {
            rw_write(&slot.records, SOURCE, "remove").pop(id);
        }
    }

    /// Evict every record of the type. Undeclared types are a no-op.
    pub fn remove_all(&self, entity_type: &str) {
        if let Some(slot) = self.slots.get(entity_type) {
            rw_write(&slot.records, SOURCE, "remove_all").clear();
        }
    }

    /// Clear all records of every type.
    pub fn clear(&self) {
        for slot in self.slots.values() {
            rw_write(&slot.records, SOURCE, "clear").clear();
        }
    }

    /// Number of records currently held for the type.
    pub fn len(&self, entity_type: &str) -> usize {
        self.slots
            .get(entity_type)
            .map(|slot| rw_read(&slot.records, SOURCE, "len").len())
            .unwrap_or(0)
    }

    /// Whether no type holds any record.
    pub fn is_empty(&self) -> bool {
        self.slots
            .values()
            .all(|slot| rw_read(&slot.records, SOURCE, "is_empty").is_empty())
    }
}
