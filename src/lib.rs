//! Declarative caching for async data-access functions.
//!
//! Entity types are declared up front with their freshness window, their
//! api operations, and the invalidation links between them. [`ApiCache`]
//! then wraps each data-access function in a decorator matching its
//! operation kind. Callers keep calling plain async functions; behind the
//! decorator, reads are cached and deduplicated, written entities are
//! stored by id, and every operation evicts exactly the entity types its
//! configuration declares.
//!
//! ```ignore
//! let user = EntityTypeConfig {
//!     ttl_ms: Some(300_000),
//!     api: BTreeMap::from([
//!         ("getUsers".to_string(), OperationKind::Get),
//!         ("createUser".to_string(), OperationKind::Post),
//!     ]),
//!     ..EntityTypeConfig::new("user")
//! };
//! let cache = ApiCache::new(vec![user])?;
//!
//! let get_users = cache.decorate_read_many("user", "getUsers", fetch_users)?;
//! let create_user = cache.decorate_create("user", "createUser", post_user)?;
//!
//! let users = get_users.call(()).await?;   // reaches upstream
//! let same = get_users.call(()).await?;    // served from cache
//! create_user.call(draft).await?;          // evicts the cached list
//! ```

pub mod config;
pub mod decorate;
pub mod entity;
pub mod error;
pub mod events;
pub mod invalidate;
pub mod keys;
pub mod query;
pub mod store;

mod lock;
mod registry;

use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

pub use crate::config::{CacheSettings, EntityRegistry, EntityTypeConfig, OperationKind};
pub use crate::decorate::{
    DecoratedCreate, DecoratedDelete, DecoratedDeleteReturning, DecoratedRead, DecoratedReadMany,
    DecoratedUpdate,
};
pub use crate::entity::{CacheEntity, EntityId};
pub use crate::error::{CacheError, ConfigError};
pub use crate::events::{CacheEvent, Epoch, EventQueue};
pub use crate::invalidate::{InvalidationPlan, Invalidator};
pub use crate::keys::{QueryKey, fingerprint_args, hash_value};
pub use crate::query::{QueryCache, QueryEntry};
pub use crate::store::{EntityRecord, EntityStore};

/// Shared cache state behind every decorator.
pub(crate) struct Core {
    pub(crate) settings: CacheSettings,
    pub(crate) registry: Arc<EntityRegistry>,
    pub(crate) store: Arc<EntityStore>,
    pub(crate) queries: Arc<QueryCache>,
    pub(crate) queue: Arc<EventQueue>,
    pub(crate) invalidator: Invalidator,
}

/// Entry point tying configuration, stores, and decorators together.
///
/// Clones are cheap and share all cache state, so one `ApiCache` can hand
/// out decorators across an application.
#[derive(Clone)]
pub struct ApiCache {
    core: Arc<Core>,
}

impl ApiCache {
    /// Build a cache over the given entity type configs with default
    /// settings.
    pub fn new(configs: Vec<EntityTypeConfig>) -> Result<Self, ConfigError> {
        Self::with_settings(configs, CacheSettings::default())
    }

    pub fn with_settings(
        configs: Vec<EntityTypeConfig>,
        settings: CacheSettings,
    ) -> Result<Self, ConfigError> {
        let registry = Arc::new(EntityRegistry::new(configs)?);
        let store = Arc::new(EntityStore::new(&registry, &settings));
        let queries = Arc::new(QueryCache::new(&settings));
        let queue = Arc::new(EventQueue::new());
        let invalidator = Invalidator::new(
            Arc::clone(&registry),
            Arc::clone(&store),
            Arc::clone(&queries),
            Arc::clone(&queue),
            &settings,
        );
        Ok(Self {
            core: Arc::new(Core {
                settings,
                registry,
                store,
                queries,
                queue,
                invalidator,
            }),
        })
    }

    /// Wrap a POST-like function declared as such on the entity type.
    pub fn decorate_create<Args, T, E, F, Fut>(
        &self,
        entity_type: &str,
        operation: &str,
        raw: F,
    ) -> Result<DecoratedCreate<Args, T, E, F>, ConfigError>
    where
        F: Fn(Args) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: CacheEntity + Serialize,
        E: StdError + Send + Sync + 'static,
    {
        self.core
            .registry
            .require_operation(entity_type, operation, OperationKind::Post)?;
        Ok(DecoratedCreate::new(
            Arc::clone(&self.core),
            entity_type.to_string(),
            operation.to_string(),
            raw,
        ))
    }

    /// Wrap a GET-like function returning a single entity.
    pub fn decorate_read<Args, T, E, F, Fut>(
        &self,
        entity_type: &str,
        operation: &str,
        raw: F,
    ) -> Result<DecoratedRead<Args, T, E, F>, ConfigError>
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        Args: Serialize + Send + 'static,
        T: CacheEntity + Serialize + DeserializeOwned + Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        self.core
            .registry
            .require_operation(entity_type, operation, OperationKind::Get)?;
        Ok(DecoratedRead::new(
            Arc::clone(&self.core),
            entity_type.to_string(),
            operation.to_string(),
            raw,
        ))
    }

    /// Wrap a GET-like function returning a list of entities.
    pub fn decorate_read_many<Args, T, E, F, Fut>(
        &self,
        entity_type: &str,
        operation: &str,
        raw: F,
    ) -> Result<DecoratedReadMany<Args, T, E, F>, ConfigError>
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<T>, E>> + Send + 'static,
        Args: Serialize + Send + 'static,
        T: CacheEntity + Serialize + DeserializeOwned + Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        self.core
            .registry
            .require_operation(entity_type, operation, OperationKind::Get)?;
        Ok(DecoratedReadMany::new(
            Arc::clone(&self.core),
            entity_type.to_string(),
            operation.to_string(),
            raw,
        ))
    }

    /// Wrap a PUT-like function declared as such on the entity type.
    pub fn decorate_update<Args, T, E, F, Fut>(
        &self,
        entity_type: &str,
        operation: &str,
        raw: F,
    ) -> Result<DecoratedUpdate<Args, T, E, F>, ConfigError>
    where
        F: Fn(Args) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: CacheEntity + Serialize,
        E: StdError + Send + Sync + 'static,
    {
        self.core
            .registry
            .require_operation(entity_type, operation, OperationKind::Put)?;
        Ok(DecoratedUpdate::new(
            Arc::clone(&self.core),
            entity_type.to_string(),
            operation.to_string(),
            raw,
        ))
    }

    /// Wrap a DELETE-like function whose arguments convert into the id of
    /// the deleted entity.
    pub fn decorate_delete<Args, T, E, F, Fut>(
        &self,
        entity_type: &str,
        operation: &str,
        raw: F,
    ) -> Result<DecoratedDelete<Args, T, E, F>, ConfigError>
    where
        F: Fn(Args) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        Args: Clone + Into<EntityId>,
        E: StdError + Send + Sync + 'static,
    {
        self.core
            .registry
            .require_operation(entity_type, operation, OperationKind::Delete)?;
        Ok(DecoratedDelete::new(
            Arc::clone(&self.core),
            entity_type.to_string(),
            operation.to_string(),
            raw,
        ))
    }

    /// Wrap a DELETE-like function that returns the deleted entity.
    pub fn decorate_delete_returning<Args, T, E, F, Fut>(
        &self,
        entity_type: &str,
        operation: &str,
        raw: F,
    ) -> Result<DecoratedDeleteReturning<Args, T, E, F>, ConfigError>
    where
        F: Fn(Args) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: CacheEntity,
        E: StdError + Send + Sync + 'static,
    {
        self.core
            .registry
            .require_operation(entity_type, operation, OperationKind::Delete)?;
        Ok(DecoratedDeleteReturning::new(
            Arc::clone(&self.core),
            entity_type.to_string(),
            operation.to_string(),
            raw,
        ))
    }

    /// Consume one batch of pending invalidation events.
    ///
    /// Decorators consume their own events inline; this is for events
    /// published manually through [`ApiCache::queue`].
    pub fn consume(&self) -> bool {
        self.core.invalidator.consume()
    }

    /// Consume pending invalidation events until the queue is empty.
    pub fn consume_all(&self) -> bool {
        self.core.invalidator.consume_all()
    }

    /// Drop all cached entities, cached queries, and pending events.
    pub fn clear(&self) {
        self.core.store.clear();
        self.core.queries.clear();
        self.core.queue.clear();
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.core.settings
    }

    pub fn registry(&self) -> &EntityRegistry {
        &self.core.registry
    }

    pub fn store(&self) -> &EntityStore {
        &self.core.store
    }

    pub fn queries(&self) -> &QueryCache {
        &self.core.queries
    }

    pub fn queue(&self) -> &EventQueue {
        &self.core.queue
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn configs() -> Vec<EntityTypeConfig> {
        vec![
            EntityTypeConfig {
                invalidates: vec!["listUser".to_string()],
                ..EntityTypeConfig::new("user")
            },
            EntityTypeConfig::new("listUser"),
        ]
    }

    #[test]
    fn clones_share_cache_state() {
        let cache = ApiCache::new(configs()).expect("cache");
        let other = cache.clone();

        cache
            .store()
            .put_value("user", json!({ "id": 1 }))
            .expect("put");

        assert!(other.store().get("user", &EntityId::from(1u64)).is_some());
    }

    #[test]
    fn manual_events_consume_through_the_facade() {
        let cache = ApiCache::new(configs()).expect("cache");
        cache
            .store()
            .put_value("user", json!({ "id": 1 }))
            .expect("put");

        cache
            .queue()
            .publish("user", OperationKind::Put, Some(EntityId::from(1u64)));
        assert_eq!(cache.queue().len(), 1);

        assert!(cache.consume());
        assert!(cache.queue().is_empty());
        assert!(cache.store().get("user", &EntityId::from(1u64)).is_none());
        assert!(!cache.consume());
    }

    #[test]
    fn clear_resets_stores_queries_and_queue() {
        let cache = ApiCache::new(configs()).expect("cache");
        cache
            .store()
            .put_value("user", json!({ "id": 1 }))
            .expect("put");
        cache.queue().publish("user", OperationKind::Put, None);

        cache.clear();

        assert!(cache.store().is_empty());
        assert!(cache.queries().is_empty());
        assert!(cache.queue().is_empty());
    }

    #[test]
    fn invalid_configuration_is_rejected_at_construction() {
        let duplicate = vec![
            EntityTypeConfig::new("user"),
            EntityTypeConfig::new("user"),
        ];
        assert!(matches!(
            ApiCache::new(duplicate),
            Err(ConfigError::DuplicateEntityType { .. })
        ));
    }
}
