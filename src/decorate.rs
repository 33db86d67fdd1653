//! Decorators wrapping async data-access functions.
//!
//! A decorator owns a handle to the shared cache core plus the wrapped
//! function, and is the only surface through which callers touch the
//! cache. Reads go through the query cache and settle entities into the
//! entity store. Writes follow one rule: publish the operation's event
//! and consume the resulting invalidation first, then apply the write's
//! own record, so a freshly written record survives its own cascade.
//!
//! Decorators are cheap to clone and the clones share cache state.

use std::collections::HashSet;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::Core;
use crate::config::OperationKind;
use crate::entity::{CacheEntity, EntityId};
use crate::error::CacheError;
use crate::keys::QueryKey;

/// Invalidate for the finished operation, draining the queue fully so the
/// caller's follow-up store write lands after the cascade.
fn write_through(core: &Core, entity_type: &str, kind: OperationKind, entity_id: Option<EntityId>) {
    core.queue.publish(entity_type, kind, entity_id);
    core.invalidator.consume_all();
}

// ==== Create ====

/// Wraps a POST-like function. The returned entity is written through to
/// the entity store and the operation's invalidation runs first.
pub struct DecoratedCreate<Args, T, E, F> {
    core: Arc<Core>,
    entity_type: String,
    operation: String,
    raw: Arc<F>,
    _marker: PhantomData<fn(Args) -> (T, E)>,
}

impl<Args, T, E, F> Clone for DecoratedCreate<Args, T, E, F> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            entity_type: self.entity_type.clone(),
            operation: self.operation.clone(),
            raw: Arc::clone(&self.raw),
            _marker: PhantomData,
        }
    }
}

impl<Args, T, E, F> fmt::Debug for DecoratedCreate<Args, T, E, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoratedCreate")
            .field("entity_type", &self.entity_type)
            .field("operation", &self.operation)
            .finish_non_exhaustive()
    }
}

impl<Args, T, E, F, Fut> DecoratedCreate<Args, T, E, F>
where
    F: Fn(Args) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    T: CacheEntity + Serialize,
    E: StdError + Send + Sync + 'static,
{
    pub(crate) fn new(core: Arc<Core>, entity_type: String, operation: String, raw: F) -> Self {
        Self {
            core,
            entity_type,
            operation,
            raw: Arc::new(raw),
            _marker: PhantomData,
        }
    }

    /// Run the wrapped call and hand its result back unchanged.
    ///
    /// On success the created entity must expose an id; it is stored after
    /// the create's invalidation plan has been applied.
    pub async fn call(&self, args: Args) -> Result<T, CacheError> {
        if !self.core.settings.enabled {
            debug!(
                entity_type = %self.entity_type,
                operation = %self.operation,
                "cache disabled, calling through"
            );
            return (self.raw)(args).await.map_err(CacheError::upstream);
        }

        let created = (self.raw)(args).await.map_err(CacheError::upstream)?;
        let id = created
            .entity_id()
            .ok_or_else(|| CacheError::invalid_entity(self.entity_type.as_str()))?;
        write_through(&self.core, &self.entity_type, OperationKind::Post, Some(id));
        self.core.store.put(&self.entity_type, &created)?;
        Ok(created)
    }
}

// ==== Read ====

/// Wraps a GET-like function returning one entity.
///
/// Results are cached under the fingerprint of the call arguments and the
/// entity itself is settled into the entity store. Concurrent calls with
/// equal arguments share a single upstream call.
pub struct DecoratedRead<Args, T, E, F> {
    core: Arc<Core>,
    entity_type: String,
    operation: String,
    raw: Arc<F>,
    _marker: PhantomData<fn(Args) -> (T, E)>,
}

impl<Args, T, E, F> Clone for DecoratedRead<Args, T, E, F> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            entity_type: self.entity_type.clone(),
            operation: self.operation.clone(),
            raw: Arc::clone(&self.raw),
            _marker: PhantomData,
        }
    }
}

impl<Args, T, E, F> fmt::Debug for DecoratedRead<Args, T, E, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoratedRead")
            .field("entity_type", &self.entity_type)
            .field("operation", &self.operation)
            .finish_non_exhaustive()
    }
}

impl<Args, T, E, F, Fut> DecoratedRead<Args, T, E, F>
where
    F: Fn(Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    Args: Serialize + Send + 'static,
    T: CacheEntity + Serialize + DeserializeOwned + Send + 'static,
    E: StdError + Send + Sync + 'static,
{
    pub(crate) fn new(core: Arc<Core>, entity_type: String, operation: String, raw: F) -> Self {
        Self {
            core,
            entity_type,
            operation,
            raw: Arc::new(raw),
            _marker: PhantomData,
        }
    }

    /// Serve the call from cache, or fetch and cache it.
    ///
    /// When the entity type declares itself in its own `invalidates` list
    /// with a GET gate, every fetch evicts the type's cached queries, the
    /// in-flight one included, so such reads always reach upstream.
    pub async fn call(&self, args: Args) -> Result<T, CacheError> {
        if !self.core.settings.enabled {
            debug!(
                entity_type = %self.entity_type,
                operation = %self.operation,
                "cache disabled, calling through"
            );
            return (self.raw)(args).await.map_err(CacheError::upstream);
        }

        let key = QueryKey::for_args(&self.entity_type, &self.operation, &args)?;
        let ttl = self.core.registry.ttl(&self.entity_type);
        let touches = HashSet::from([self.entity_type.clone()]);

        let core = Arc::clone(&self.core);
        let raw = Arc::clone(&self.raw);
        let entity_type = self.entity_type.clone();
        let cached = self
            .core
            .queries
            .read(key, touches, ttl, async move {
                let value = (raw)(args).await.map_err(CacheError::upstream)?;
                let id = value
                    .entity_id()
                    .ok_or_else(|| CacheError::invalid_entity(entity_type.as_str()))?;
                if core.registry.read_invalidates(&entity_type) {
                    write_through(&core, &entity_type, OperationKind::Get, Some(id));
                }
                let record = core.store.put(&entity_type, &value)?;
                Ok(Arc::new(record.value))
            })
            .await?;
        serde_json::from_value((*cached).clone()).map_err(CacheError::decode)
    }
}

// ==== Read many ====

/// Wraps a GET-like function returning a list of entities.
///
/// The list result is cached as one query while every element is settled
/// into the entity store individually.
pub struct DecoratedReadMany<Args, T, E, F> {
    core: Arc<Core>,
    entity_type: String,
    operation: String,
    raw: Arc<F>,
    _marker: PhantomData<fn(Args) -> (T, E)>,
}

impl<Args, T, E, F> Clone for DecoratedReadMany<Args, T, E, F> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            entity_type: self.entity_type.clone(),
            operation: self.operation.clone(),
            raw: Arc::clone(&self.raw),
            _marker: PhantomData,
        }
    }
}

impl<Args, T, E, F, Fut> DecoratedReadMany<Args, T, E, F>
where
    F: Fn(Args) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<T>, E>> + Send + 'static,
    Args: Serialize + Send + 'static,
    T: CacheEntity + Serialize + DeserializeOwned + Send + 'static,
    E: StdError + Send + Sync + 'static,
{
    pub(crate) fn new(core: Arc<Core>, entity_type: String, operation: String, raw: F) -> Self {
        Self {
            core,
            entity_type,
            operation,
            raw: Arc::new(raw),
            _marker: PhantomData,
        }
    }

    pub async fn call(&self, args: Args) -> Result<Vec<T>, CacheError> {
        if !self.core.settings.enabled {
            debug!(
                entity_type = %self.entity_type,
                operation = %self.operation,
                "cache disabled, calling through"
            );
            return (self.raw)(args).await.map_err(CacheError::upstream);
        }

        let key = QueryKey::for_args(&self.entity_type, &self.operation, &args)?;
        let ttl = self.core.registry.ttl(&self.entity_type);
        let touches = HashSet::from([self.entity_type.clone()]);

        let core = Arc::clone(&self.core);
        let raw = Arc::clone(&self.raw);
        let entity_type = self.entity_type.clone();
        let cached = self
            .core
            .queries
            .read(key, touches, ttl, async move {
                let items = (raw)(args).await.map_err(CacheError::upstream)?;
                if core.registry.read_invalidates(&entity_type) {
                    write_through(&core, &entity_type, OperationKind::Get, None);
                }
                let mut encoded = Vec::with_capacity(items.len());
                for item in &items {
                    let record = core.store.put(&entity_type, item)?;
                    encoded.push(record.value);
                }
                Ok(Arc::new(Value::Array(encoded)))
            })
            .await?;
        serde_json::from_value((*cached).clone()).map_err(CacheError::decode)
    }
}

// ==== Update ====

/// Wraps a PUT-like function. Works like create under a PUT event: the
/// returned entity replaces the stored record after invalidation.
pub struct DecoratedUpdate<Args, T, E, F> {
    core: Arc<Core>,
    entity_type: String,
    operation: String,
    raw: Arc<F>,
    _marker: PhantomData<fn(Args) -> (T, E)>,
}

impl<Args, T, E, F> Clone for DecoratedUpdate<Args, T, E, F> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            entity_type: self.entity_type.clone(),
            operation: self.operation.clone(),
            raw: Arc::clone(&self.raw),
            _marker: PhantomData,
        }
    }
}

impl<Args, T, E, F, Fut> DecoratedUpdate<Args, T, E, F>
where
    F: Fn(Args) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    T: CacheEntity + Serialize,
    E: StdError + Send + Sync + 'static,
{
    pub(crate) fn new(core: Arc<Core>, entity_type: String, operation: String, raw: F) -> Self {
        Self {
            core,
            entity_type,
            operation,
            raw: Arc::new(raw),
            _marker: PhantomData,
        }
    }

    pub async fn call(&self, args: Args) -> Result<T, CacheError> {
        if !self.core.settings.enabled {
            debug!(
                entity_type = %self.entity_type,
                operation = %self.operation,
                "cache disabled, calling through"
            );
            return (self.raw)(args).await.map_err(CacheError::upstream);
        }

        let updated = (self.raw)(args).await.map_err(CacheError::upstream)?;
        let id = updated
            .entity_id()
            .ok_or_else(|| CacheError::invalid_entity(self.entity_type.as_str()))?;
        write_through(&self.core, &self.entity_type, OperationKind::Put, Some(id));
        self.core.store.put(&self.entity_type, &updated)?;
        Ok(updated)
    }
}

// ==== Delete ====

/// Wraps a DELETE-like function whose arguments carry the entity id.
pub struct DecoratedDelete<Args, T, E, F> {
    core: Arc<Core>,
    entity_type: String,
    operation: String,
    raw: Arc<F>,
    _marker: PhantomData<fn(Args) -> (T, E)>,
}

impl<Args, T, E, F> Clone for DecoratedDelete<Args, T, E, F> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            entity_type: self.entity_type.clone(),
            operation: self.operation.clone(),
            raw: Arc::clone(&self.raw),
            _marker: PhantomData,
        }
    }
}

impl<Args, T, E, F, Fut> DecoratedDelete<Args, T, E, F>
where
    F: Fn(Args) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    Args: Clone + Into<EntityId>,
    E: StdError + Send + Sync + 'static,
{
    pub(crate) fn new(core: Arc<Core>, entity_type: String, operation: String, raw: F) -> Self {
        Self {
            core,
            entity_type,
            operation,
            raw: Arc::new(raw),
            _marker: PhantomData,
        }
    }

    /// Run the wrapped call, then drop the entity's record and every query
    /// the delete invalidates.
    pub async fn call(&self, args: Args) -> Result<T, CacheError> {
        if !self.core.settings.enabled {
            debug!(
                entity_type = %self.entity_type,
                operation = %self.operation,
                "cache disabled, calling through"
            );
            return (self.raw)(args).await.map_err(CacheError::upstream);
        }

        let id: EntityId = args.clone().into();
        let deleted = (self.raw)(args).await.map_err(CacheError::upstream)?;
        write_through(
            &self.core,
            &self.entity_type,
            OperationKind::Delete,
            Some(id.clone()),
        );
        self.core.store.remove(&self.entity_type, &id);
        Ok(deleted)
    }
}

// ==== Delete returning ====

/// Wraps a DELETE-like function that returns the deleted entity; the id is
/// taken from the result instead of the arguments.
pub struct DecoratedDeleteReturning<Args, T, E, F> {
    core: Arc<Core>,
    entity_type: String,
    operation: String,
    raw: Arc<F>,
    _marker: PhantomData<fn(Args) -> (T, E)>,
}

impl<Args, T, E, F> Clone for DecoratedDeleteReturning<Args, T, E, F> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            entity_type: self.entity_type.clone(),
            operation: self.operation.clone(),
            raw: Arc::clone(&self.raw),
            _marker: PhantomData,
        }
    }
}

impl<Args, T, E, F, Fut> DecoratedDeleteReturning<Args, T, E, F>
where
    F: Fn(Args) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    T: CacheEntity,
    E: StdError + Send + Sync + 'static,
{
    pub(crate) fn new(core: Arc<Core>, entity_type: String, operation: String, raw: F) -> Self {
        Self {
            core,
            entity_type,
            operation,
            raw: Arc::new(raw),
            _marker: PhantomData,
        }
    }

    pub async fn call(&self, args: Args) -> Result<T, CacheError> {
        if !self.core.settings.enabled {
            debug!(
                entity_type = %self.entity_type,
                operation = %self.operation,
                "cache disabled, calling through"
            );
            return (self.raw)(args).await.map_err(CacheError::upstream);
        }

        let deleted = (self.raw)(args).await.map_err(CacheError::upstream)?;
        let id = deleted
            .entity_id()
            .ok_or_else(|| CacheError::invalid_entity(self.entity_type.as_str()))?;
        write_through(
            &self.core,
            &self.entity_type,
            OperationKind::Delete,
            Some(id.clone()),
        );
        self.core.store.remove(&self.entity_type, &id);
        Ok(deleted)
    }
}
