//! Declarative cache configuration.
//!
//! Cache behavior is described as data: each [`EntityTypeConfig`] names an
//! entity type, its freshness window, the operations its api exposes, and
//! the other types those operations invalidate. An [`EntityRegistry`]
//! validates the whole table once at startup; everything downstream reads
//! from it.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::num::NonZeroUsize;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// Default values for runtime settings
const DEFAULT_ENTITY_LIMIT: usize = 500;
const DEFAULT_QUERY_LIMIT: usize = 200;
const DEFAULT_CONSUME_BATCH_LIMIT: usize = 100;

/// Classification of a decorated operation, in HTTP verb terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationKind {
    Get,
    Post,
    Put,
    Delete,
}

impl OperationKind {
    /// Whether this kind rewrites entity state.
    pub fn is_mutation(self) -> bool {
        !matches!(self, Self::Get)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// Declarative description of one entity type.
#[derive(Debug, Clone, Deserialize)]
pub struct EntityTypeConfig {
    /// Unique name of the entity type.
    pub name: String,
    /// Freshness window in milliseconds. Zero or absent means values stay
    /// until explicitly invalidated.
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    /// Logical operation name to the kind it performs. Decorators refuse
    /// operations missing from this table.
    #[serde(default)]
    pub api: BTreeMap<String, OperationKind>,
    /// Entity types evicted when this type's operations run. Names that
    /// match no declared type are tolerated and skipped.
    #[serde(default)]
    pub invalidates: Vec<String>,
    /// Operation kinds that fire the `invalidates` list. Empty means every
    /// kind fires it.
    #[serde(default)]
    pub invalidates_on: Vec<OperationKind>,
    /// Marks this type as a derived projection of another type.
    /// Invalidating the base invalidates all of its views, never the
    /// reverse.
    #[serde(default)]
    pub view_of: Option<String>,
}

impl EntityTypeConfig {
    /// Config for the named type with no ttl, no api, and no links.
    ///
    /// Intended as a base for struct update syntax:
    ///
    /// ```ignore
    /// let user = EntityTypeConfig {
    ///     ttl_ms: Some(300_000),
    ///     invalidates: vec!["userPreview".to_string()],
    ///     ..EntityTypeConfig::new("user")
    /// };
    /// ```
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ttl_ms: None,
            api: BTreeMap::new(),
            invalidates: Vec::new(),
            invalidates_on: Vec::new(),
            view_of: None,
        }
    }
}

/// Runtime sizing and behavior knobs.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Enable caching. When false, decorated calls pass straight through.
    pub enabled: bool,
    /// Maximum records kept per entity type.
    pub entity_limit: usize,
    /// Maximum cached query results across all types.
    pub query_limit: usize,
    /// Maximum events per consumption batch.
    pub consume_batch_limit: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            entity_limit: DEFAULT_ENTITY_LIMIT,
            query_limit: DEFAULT_QUERY_LIMIT,
            consume_batch_limit: DEFAULT_CONSUME_BATCH_LIMIT,
        }
    }
}

impl CacheSettings {
    /// Returns the per-type record limit as NonZeroUsize, clamping to 1 if zero.
    pub fn entity_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.entity_limit).unwrap_or(NonZeroUsize::MIN)
    }

    /// Returns the query result limit as NonZeroUsize, clamping to 1 if zero.
    pub fn query_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.query_limit).unwrap_or(NonZeroUsize::MIN)
    }
}

/// Validated set of entity type configs with precomputed relations.
///
/// Construction fails fast on duplicate names, views over undeclared
/// types, and cyclic view chains. A `ttl_ms` of zero is normalized to
/// "no expiry" so downstream code has a single representation.
#[derive(Debug)]
pub struct EntityRegistry {
    entries: Vec<EntityTypeConfig>,
    index: HashMap<String, usize>,
    views: HashMap<String, Vec<String>>,
}

impl EntityRegistry {
    pub fn new(configs: Vec<EntityTypeConfig>) -> Result<Self, ConfigError> {
        let mut index = HashMap::new();
        for (position, config) in configs.iter().enumerate() {
            if index.insert(config.name.clone(), position).is_some() {
                return Err(ConfigError::DuplicateEntityType {
                    name: config.name.clone(),
                });
            }
        }

        let mut views: HashMap<String, Vec<String>> = HashMap::new();
        for config in &configs {
            if let Some(base) = &config.view_of {
                if !index.contains_key(base) {
                    return Err(ConfigError::UnknownViewBase {
                        view: config.name.clone(),
                        base: base.clone(),
                    });
                }
                views.entry(base.clone()).or_default().push(config.name.clone());
            }
        }

        for config in &configs {
            let mut seen = HashSet::new();
            seen.insert(config.name.as_str());
            let mut current = config.view_of.as_deref();
            while let Some(base) = current {
                if !seen.insert(base) {
                    return Err(ConfigError::ViewCycle {
                        name: config.name.clone(),
                    });
                }
                current = index
                    .get(base)
                    .and_then(|position| configs[*position].view_of.as_deref());
            }
        }

        let mut entries = configs;
        for entry in &mut entries {
            if entry.ttl_ms == Some(0) {
                entry.ttl_ms = None;
            }
        }

        Ok(Self {
            entries,
            index,
            views,
        })
    }

    pub fn get(&self, name: &str) -> Option<&EntityTypeConfig> {
        self.index.get(name).map(|position| &self.entries[*position])
    }

    pub fn require(&self, name: &str) -> Result<&EntityTypeConfig, ConfigError> {
        self.get(name)
            .ok_or_else(|| ConfigError::unknown_entity_type(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Freshness window for the type, when one is configured.
    pub fn ttl(&self, name: &str) -> Option<Duration> {
        self.get(name)?.ttl_ms.map(Duration::from_millis)
    }

    /// Types declared as views over `base`, in declaration order.
    pub fn views_of(&self, base: &str) -> &[String] {
        self.views.get(base).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Whether `kind` fires the type's `invalidates` list.
    pub fn triggers_on(&self, name: &str, kind: OperationKind) -> bool {
        match self.get(name) {
            Some(config) => {
                config.invalidates_on.is_empty() || config.invalidates_on.contains(&kind)
            }
            None => false,
        }
    }

    /// Whether a successful read of the type evicts anything.
    pub fn read_invalidates(&self, name: &str) -> bool {
        match self.get(name) {
            Some(config) => {
                !config.invalidates.is_empty() && self.triggers_on(name, OperationKind::Get)
            }
            None => false,
        }
    }

    /// Verify that `operation` is declared on `entity_type` with the
    /// expected kind. Decorator constructors call this before binding.
    pub fn require_operation(
        &self,
        entity_type: &str,
        operation: &str,
        kind: OperationKind,
    ) -> Result<(), ConfigError> {
        let config = self.require(entity_type)?;
        match config.api.get(operation) {
            None => Err(ConfigError::UnknownOperation {
                entity_type: entity_type.to_string(),
                operation: operation.to_string(),
            }),
            Some(declared) if *declared != kind => Err(ConfigError::OperationKindMismatch {
                entity_type: entity_type.to_string(),
                operation: operation.to_string(),
                declared: *declared,
                requested: kind,
            }),
            Some(_) => Ok(()),
        }
    }

    /// Declared type names in declaration order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
