//! Entity identity.
//!
//! Every cached record is addressed by an [`EntityId`] within its entity
//! type. Payload types opt in through the [`CacheEntity`] trait, which
//! names the field their identity comes from.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identity of a record within its entity type.
///
/// Ids are compared by their string form regardless of the source type, so
/// a payload carrying `"id": 1` and a lookup by `1u64` address the same
/// record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<u64> for EntityId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

impl From<i64> for EntityId {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl From<Uuid> for EntityId {
    fn from(id: Uuid) -> Self {
        Self(id.to_string())
    }
}

/// Capability to derive an identity from a payload.
///
/// Returning `None` means the value cannot be cached as an entity; callers
/// surface that as an invalid-entity error before any cache state changes.
pub trait CacheEntity {
    fn entity_id(&self) -> Option<EntityId>;
}

/// Untyped payloads use the conventional `"id"` field, accepting string
/// and integer representations.
impl CacheEntity for Value {
    fn entity_id(&self) -> Option<EntityId> {
        match self.get("id")? {
            Value::String(id) => Some(EntityId::new(id.clone())),
            Value::Number(id) => Some(EntityId::new(id.to_string())),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn json_value_string_id() {
        let value = json!({ "id": "abc", "name": "Kalle" });
        assert_eq!(value.entity_id(), Some(EntityId::new("abc")));
    }

    #[test]
    fn json_value_numeric_id() {
        let value = json!({ "id": 1, "name": "Kalle" });
        assert_eq!(value.entity_id(), Some(EntityId::new("1")));
    }

    #[test]
    fn json_value_without_id() {
        let value = json!({ "name": "Kalle" });
        assert!(value.entity_id().is_none());
    }

    #[test]
    fn json_value_with_null_id() {
        let value = json!({ "id": null });
        assert!(value.entity_id().is_none());
    }

    #[test]
    fn numeric_and_string_sources_compare_equal() {
        assert_eq!(EntityId::from(1u64), EntityId::from("1"));
        assert_eq!(EntityId::from(-7i64), EntityId::new("-7"));
    }

    #[test]
    fn display_is_the_raw_id() {
        let id = EntityId::from(Uuid::nil());
        assert_eq!(id.to_string(), Uuid::nil().to_string());
        assert_eq!(EntityId::new("user-1").to_string(), "user-1");
    }
}
