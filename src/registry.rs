//! Bidirectional index between entity types and cached queries.
//!
//! The forward direction answers "which cached queries touch this entity
//! type"; the reverse direction cleans the forward maps up when an entry
//! is evicted. The index carries no lock of its own: it lives inside the
//! query cache's state so invalidation always observes entries and index
//! as one consistent pair.

use std::collections::{HashMap, HashSet};

use crate::keys::QueryKey;

#[derive(Debug, Default)]
pub(crate) struct TouchIndex {
    type_to_keys: HashMap<String, HashSet<QueryKey>>,
    key_to_types: HashMap<QueryKey, HashSet<String>>,
}

impl TouchIndex {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a query key with the entity types it touches.
    ///
    /// Re-registering a key replaces its previous touches entirely.
    pub(crate) fn register(&mut self, key: QueryKey, touches: HashSet<String>) {
        self.unregister(&key);
        for entity_type in &touches {
            self.type_to_keys
                .entry(entity_type.clone())
                .or_default()
                .insert(key.clone());
        }
        self.key_to_types.insert(key, touches);
    }

    /// Query keys touching the given entity type.
    pub(crate) fn keys_for_type(&self, entity_type: &str) -> HashSet<QueryKey> {
        self.type_to_keys
            .get(entity_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Entity types the given key touches.
    pub(crate) fn types_for_key(&self, key: &QueryKey) -> HashSet<String> {
        self.key_to_types.get(key).cloned().unwrap_or_default()
    }

    /// Remove a key and clean up the forward mappings.
    pub(crate) fn unregister(&mut self, key: &QueryKey) {
        if let Some(types) = self.key_to_types.remove(key) {
            for entity_type in types {
                if let Some(keys) = self.type_to_keys.get_mut(&entity_type) {
                    keys.remove(key);
                    if keys.is_empty() {
                        self.type_to_keys.remove(&entity_type);
                    }
                }
            }
        }
    }

    /// Drop all mappings.
    pub(crate) fn clear(&mut self) {
        self.type_to_keys.clear();
        self.key_to_types.clear();
    }

    /// Number of entity types with at least one registered key.
    pub(crate) fn type_count(&self) -> usize {
        self.type_to_keys.len()
    }

    /// Number of registered query keys.
    pub(crate) fn key_count(&self) -> usize {
        self.key_to_types.len()
    }
}
