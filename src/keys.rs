//! Query cache key definitions and hashing.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::Serialize;

use crate::error::CacheError;

/// Fingerprint of one decorated call: the operation that ran and a hash of
/// the arguments it ran with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey {
    /// Entity type the operation belongs to.
    pub entity_type: String,
    /// Logical operation name from the entity's api table.
    pub operation: String,
    /// Canonical hash of the serialized call arguments.
    pub args_hash: u64,
}

impl QueryKey {
    pub fn new(
        entity_type: impl Into<String>,
        operation: impl Into<String>,
        args_hash: u64,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            operation: operation.into(),
            args_hash,
        }
    }

    /// Build a key from serializable call arguments.
    pub fn for_args<A: Serialize>(
        entity_type: &str,
        operation: &str,
        args: &A,
    ) -> Result<Self, CacheError> {
        Ok(Self::new(entity_type, operation, fingerprint_args(args)?))
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}#{:016x}",
            self.entity_type, self.operation, self.args_hash
        )
    }
}

// ============================================================================
// Hashing
// ============================================================================

/// Hash any hashable value with the std default hasher.
pub fn hash_value<T: Hash>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Hash call arguments through their canonical JSON encoding.
///
/// `serde_json` keeps object keys sorted, so structurally equal arguments
/// fingerprint identically regardless of field declaration order.
pub fn fingerprint_args<A: Serialize>(args: &A) -> Result<u64, CacheError> {
    let canonical = serde_json::to_value(args).map_err(CacheError::encode)?;
    Ok(hash_value(&canonical.to_string()))
}
