//! Error types for configuration and cache operations.

use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

use crate::config::OperationKind;

/// Rejections raised while validating entity configuration or binding
/// decorators to it.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("entity type `{name}` is declared more than once")]
    DuplicateEntityType { name: String },
    #[error("`{view}` is declared as a view of unknown entity type `{base}`")]
    UnknownViewBase { view: String, base: String },
    #[error("view chain starting at `{name}` forms a cycle")]
    ViewCycle { name: String },
    #[error("unknown entity type `{name}`")]
    UnknownEntityType { name: String },
    #[error("entity type `{entity_type}` declares no operation named `{operation}`")]
    UnknownOperation {
        entity_type: String,
        operation: String,
    },
    #[error(
        "operation `{operation}` on `{entity_type}` is declared as {declared}, not {requested}"
    )]
    OperationKindMismatch {
        entity_type: String,
        operation: String,
        declared: OperationKind,
        requested: OperationKind,
    },
}

impl ConfigError {
    pub fn unknown_entity_type(name: impl Into<String>) -> Self {
        Self::UnknownEntityType { name: name.into() }
    }
}

/// Failures surfaced by decorated calls.
///
/// The type is `Clone` so a single in-flight failure can be handed to every
/// caller coalesced onto the same upstream call; causes are held in `Arc`
/// for that reason. Cache misses are not errors and never appear here.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// No identity could be extracted from a payload that must be cached.
    #[error("no id could be extracted from a `{entity_type}` payload")]
    InvalidEntity { entity_type: String },
    #[error("unknown entity type `{name}`")]
    UnknownEntityType { name: String },
    #[error("failed to encode value for caching")]
    Encode(#[source] Arc<serde_json::Error>),
    #[error("failed to decode cached value")]
    Decode(#[source] Arc<serde_json::Error>),
    /// The wrapped data-access function failed. The original error is
    /// preserved and reachable through `source`/`downcast`.
    #[error(transparent)]
    Upstream(Arc<dyn StdError + Send + Sync + 'static>),
}

impl CacheError {
    pub fn invalid_entity(entity_type: impl Into<String>) -> Self {
        Self::InvalidEntity {
            entity_type: entity_type.into(),
        }
    }

    pub fn unknown_entity_type(name: impl Into<String>) -> Self {
        Self::UnknownEntityType { name: name.into() }
    }

    pub(crate) fn encode(source: serde_json::Error) -> Self {
        Self::Encode(Arc::new(source))
    }

    pub(crate) fn decode(source: serde_json::Error) -> Self {
        Self::Decode(Arc::new(source))
    }

    pub fn upstream<E>(source: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Upstream(Arc::new(source))
    }

    /// Whether this error carries through an upstream failure.
    pub fn is_upstream(&self) -> bool {
        matches!(self, Self::Upstream(_))
    }

    /// The upstream failure as its concrete type, when it is one.
    pub fn upstream_as<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        match self {
            Self::Upstream(source) => source.downcast_ref::<E>(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("backend unreachable: {reason}")]
    struct BackendError {
        reason: String,
    }

    #[test]
    fn upstream_preserves_message_and_type() {
        let error = CacheError::upstream(BackendError {
            reason: "connection refused".to_string(),
        });

        assert!(error.is_upstream());
        assert_eq!(error.to_string(), "backend unreachable: connection refused");

        let original = error
            .upstream_as::<BackendError>()
            .expect("downcast to original type");
        assert_eq!(original.reason, "connection refused");
    }

    #[test]
    fn upstream_downcast_to_wrong_type_is_none() {
        let error = CacheError::upstream(BackendError {
            reason: "timeout".to_string(),
        });
        assert!(error.upstream_as::<std::io::Error>().is_none());
    }

    #[test]
    fn errors_are_cloneable() {
        let error = CacheError::upstream(BackendError {
            reason: "boom".to_string(),
        });
        let copy = error.clone();
        assert_eq!(error.to_string(), copy.to_string());
    }

    #[test]
    fn invalid_entity_names_the_type() {
        let error = CacheError::invalid_entity("user");
        assert!(error.to_string().contains("`user`"));
        assert!(!error.is_upstream());
    }
}
