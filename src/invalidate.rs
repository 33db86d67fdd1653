//! Invalidation planning and execution.
//!
//! Every decorated operation publishes a [`CacheEvent`](crate::events::CacheEvent).
//! The [`InvalidationPlan`] turns a batch of events into the set of entity
//! types to evict, honoring each type's `invalidates` and `invalidates_on`
//! declarations plus its views. The [`Invalidator`] drains the queue and
//! applies the plan to both the entity store and the query cache.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use tracing::{debug, info, instrument};

use crate::config::{CacheSettings, EntityRegistry, OperationKind};
use crate::events::{CacheEvent, EventQueue};
use crate::query::QueryCache;
use crate::store::EntityStore;

const METRIC_CONSUME_MS: &str = "dispensa_consume_ms";

// ==== Planning ====

/// Set of entity types to evict for a batch of cache events.
///
/// For a mutation the mutated type itself is always evicted. A type's
/// `invalidates` list fires when its `invalidates_on` gate admits the
/// operation kind, an empty gate admitting every kind including reads.
/// Views of an evicted type are evicted with it. The expansion runs to a
/// fixed point, so chains and cycles of `invalidates` terminate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationPlan {
    evict: HashSet<String>,
}

impl InvalidationPlan {
    /// Plan for a single operation on one entity type.
    pub fn for_operation(
        registry: &EntityRegistry,
        entity_type: &str,
        kind: OperationKind,
    ) -> Self {
        let mut plan = Self::default();
        let mut pending: Vec<String> = Vec::new();

        if kind.is_mutation() {
            pending.push(entity_type.to_string());
        } else if let Some(entry) = registry.get(entity_type)
            && registry.triggers_on(entity_type, kind)
        {
            // a read never evicts its own type, only its declared victims
            pending.extend(entry.invalidates.iter().cloned());
        }

        while let Some(name) = pending.pop() {
            let Some(entry) = registry.get(&name) else {
                debug!(entity_type = %name, "invalidation target not declared, skipped");
                continue;
            };
            if !plan.evict.insert(name.clone()) {
                continue;
            }
            pending.extend(registry.views_of(&name).iter().cloned());
            if registry.triggers_on(&name, kind) {
                pending.extend(entry.invalidates.iter().cloned());
            }
        }

        plan
    }

    pub fn for_event(registry: &EntityRegistry, event: &CacheEvent) -> Self {
        Self::for_operation(registry, &event.entity_type, event.kind)
    }

    /// Union of per-event plans. Events sharing an id are counted once.
    pub fn from_events(registry: &EntityRegistry, events: &[CacheEvent]) -> Self {
        let mut plan = Self::default();
        let mut seen = HashSet::new();
        for event in events {
            if !seen.insert(event.id) {
                continue;
            }
            plan.evict.extend(Self::for_event(registry, event).evict);
        }
        plan
    }

    /// Entity types in the plan, sorted for deterministic output.
    pub fn members(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.evict.iter().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn contains(&self, entity_type: &str) -> bool {
        self.evict.contains(entity_type)
    }

    pub fn len(&self) -> usize {
        self.evict.len()
    }

    pub fn is_empty(&self) -> bool {
        self.evict.is_empty()
    }
}

impl fmt::Display for InvalidationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.evict.is_empty() {
            return f.write_str("(none)");
        }
        f.write_str(&self.members().join(", "))
    }
}

// ==== Execution ====

/// Drains published events and applies their invalidation plan.
pub struct Invalidator {
    registry: Arc<EntityRegistry>,
    store: Arc<EntityStore>,
    queries: Arc<QueryCache>,
    queue: Arc<EventQueue>,
    batch_limit: usize,
}

impl Invalidator {
    pub fn new(
        registry: Arc<EntityRegistry>,
        store: Arc<EntityStore>,
        queries: Arc<QueryCache>,
        queue: Arc<EventQueue>,
        settings: &CacheSettings,
    ) -> Self {
        Self {
            registry,
            store,
            queries,
            queue,
            batch_limit: settings.consume_batch_limit.max(1),
        }
    }

    /// Consume one batch of pending events.
    ///
    /// Evicts every planned entity type from the entity store and every
    /// query touching one of them. Returns whether any events were
    /// consumed; a batch whose plan is empty still counts as consumed.
    #[instrument(skip(self))]
    pub fn consume(&self) -> bool {
        let events = self.queue.drain(self.batch_limit);
        if events.is_empty() {
            return false;
        }
        let started = Instant::now();

        let plan = InvalidationPlan::from_events(&self.registry, &events);
        let event_ids: Vec<String> = events.iter().map(|event| event.id.to_string()).collect();
        info!(
            event_count = events.len(),
            event_ids = ?event_ids,
            plan = %plan,
            "Cache invalidation started"
        );

        let mut evicted_queries = 0;
        for name in plan.members() {
            self.store.remove_all(name);
            evicted_queries += self.queries.invalidate(name);
        }

        info!(
            event_count = events.len(),
            evicted_types = plan.len(),
            evicted_queries,
            "Cache invalidation complete"
        );
        histogram!(METRIC_CONSUME_MS).record(started.elapsed().as_secs_f64() * 1000.0);
        true
    }

    /// Consume batches until the queue is empty.
    ///
    /// Returns whether any batch was consumed.
    pub fn consume_all(&self) -> bool {
        let mut consumed = false;
        while self.consume() {
            consumed = true;
        }
        consumed
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::config::EntityTypeConfig;
    use crate::entity::EntityId;
    use crate::keys::QueryKey;

    use super::*;

    fn registry(configs: Vec<EntityTypeConfig>) -> EntityRegistry {
        EntityRegistry::new(configs).expect("registry should validate")
    }

    fn user_registry() -> EntityRegistry {
        registry(vec![
            EntityTypeConfig {
                invalidates: vec!["listUser".to_string()],
                ..EntityTypeConfig::new("user")
            },
            EntityTypeConfig {
                view_of: Some("user".to_string()),
                ..EntityTypeConfig::new("userPreview")
            },
            EntityTypeConfig::new("listUser"),
        ])
    }

    #[test]
    fn mutation_evicts_the_type_its_views_and_its_victims() {
        let registry = user_registry();

        let plan = InvalidationPlan::for_operation(&registry, "user", OperationKind::Post);

        assert_eq!(plan.members(), vec!["listUser", "user", "userPreview"]);
    }

    #[test]
    fn read_evicts_only_declared_victims() {
        let registry = user_registry();

        let plan = InvalidationPlan::for_operation(&registry, "user", OperationKind::Get);

        assert!(!plan.contains("user"));
        assert!(!plan.contains("userPreview"));
        assert_eq!(plan.members(), vec!["listUser"]);
    }

    #[test]
    fn gate_blocks_the_victim_list_but_not_the_mutated_type() {
        let registry = registry(vec![
            EntityTypeConfig {
                invalidates: vec!["listUser".to_string()],
                invalidates_on: vec![OperationKind::Get],
                ..EntityTypeConfig::new("user")
            },
            EntityTypeConfig {
                view_of: Some("user".to_string()),
                ..EntityTypeConfig::new("userPreview")
            },
            EntityTypeConfig::new("listUser"),
        ]);

        let plan = InvalidationPlan::for_operation(&registry, "user", OperationKind::Post);

        // POST is outside the gate, so listUser survives while the
        // mutated type and its view are still evicted
        assert_eq!(plan.members(), vec!["user", "userPreview"]);
    }

    #[test]
    fn view_chains_evict_transitively() {
        let registry = registry(vec![
            EntityTypeConfig::new("article"),
            EntityTypeConfig {
                view_of: Some("article".to_string()),
                ..EntityTypeConfig::new("articleSummary")
            },
            EntityTypeConfig {
                view_of: Some("articleSummary".to_string()),
                ..EntityTypeConfig::new("articleTeaser")
            },
        ]);

        let plan = InvalidationPlan::for_operation(&registry, "article", OperationKind::Put);

        assert_eq!(plan.members(), vec!["article", "articleSummary", "articleTeaser"]);
    }

    #[test]
    fn invalidation_cycles_terminate() {
        let registry = registry(vec![
            EntityTypeConfig {
                invalidates: vec!["comment".to_string()],
                ..EntityTypeConfig::new("post")
            },
            EntityTypeConfig {
                invalidates: vec!["post".to_string()],
                ..EntityTypeConfig::new("comment")
            },
        ]);

        let plan = InvalidationPlan::for_operation(&registry, "post", OperationKind::Delete);

        assert_eq!(plan.members(), vec!["comment", "post"]);
    }

    #[test]
    fn undeclared_victims_are_skipped() {
        let registry = registry(vec![EntityTypeConfig {
            invalidates: vec!["ghost".to_string()],
            ..EntityTypeConfig::new("user")
        }]);

        let plan = InvalidationPlan::for_operation(&registry, "user", OperationKind::Post);

        assert_eq!(plan.members(), vec!["user"]);
    }

    #[test]
    fn duplicate_events_count_once() {
        let registry = user_registry();
        let event = CacheEvent::new("user", OperationKind::Post, Some(EntityId::from(1u64)), 0);

        let once = InvalidationPlan::from_events(&registry, std::slice::from_ref(&event));
        let twice = InvalidationPlan::from_events(&registry, &[event.clone(), event]);

        assert_eq!(once, twice);
    }

    #[test]
    fn plans_from_distinct_events_union() {
        let registry = registry(vec![
            EntityTypeConfig::new("user"),
            EntityTypeConfig::new("account"),
        ]);
        let events = vec![
            CacheEvent::new("user", OperationKind::Put, Some(EntityId::from(1u64)), 0),
            CacheEvent::new("account", OperationKind::Delete, Some(EntityId::from(2u64)), 1),
        ];

        let plan = InvalidationPlan::from_events(&registry, &events);

        assert_eq!(plan.members(), vec!["account", "user"]);
    }

    #[test]
    fn display_lists_members_sorted() {
        let registry = user_registry();

        let plan = InvalidationPlan::for_operation(&registry, "user", OperationKind::Post);
        let none = InvalidationPlan::default();

        assert_eq!(plan.to_string(), "listUser, user, userPreview");
        assert_eq!(none.to_string(), "(none)");
    }

    // ==== Invalidator ====

    struct Fixture {
        store: Arc<EntityStore>,
        queries: Arc<QueryCache>,
        queue: Arc<EventQueue>,
        invalidator: Invalidator,
    }

    fn fixture(settings: CacheSettings) -> Fixture {
        let registry = Arc::new(registry(vec![
            EntityTypeConfig {
                invalidates: vec!["listUser".to_string()],
                ..EntityTypeConfig::new("user")
            },
            EntityTypeConfig {
                view_of: Some("user".to_string()),
                ..EntityTypeConfig::new("userPreview")
            },
            EntityTypeConfig::new("listUser"),
            EntityTypeConfig::new("account"),
        ]));
        let store = Arc::new(EntityStore::new(&registry, &settings));
        let queries = Arc::new(QueryCache::new(&settings));
        let queue = Arc::new(EventQueue::new());
        let invalidator = Invalidator::new(
            registry,
            Arc::clone(&store),
            Arc::clone(&queries),
            Arc::clone(&queue),
            &settings,
        );
        Fixture {
            store,
            queries,
            queue,
            invalidator,
        }
    }

    async fn seed_query(fix: &Fixture, key: &QueryKey, touch: &str) {
        let touches = HashSet::from([touch.to_string()]);
        fix.queries
            .read(key.clone(), touches, None, async { Ok(Arc::new(json!([]))) })
            .await
            .expect("seed read");
    }

    #[tokio::test]
    async fn consume_evicts_planned_stores_and_queries() {
        let fix = fixture(CacheSettings::default());
        let id = EntityId::from(1u64);
        fix.store
            .put_value("user", json!({ "id": 1, "name": "Kalle" }))
            .expect("put");

        let list_key = QueryKey::new("listUser", "getList", 0);
        let preview_key = QueryKey::new("userPreview", "getPreviews", 0);
        let account_key = QueryKey::new("account", "getAccounts", 0);
        seed_query(&fix, &list_key, "listUser").await;
        seed_query(&fix, &preview_key, "userPreview").await;
        seed_query(&fix, &account_key, "account").await;

        fix.queue
            .publish("user", OperationKind::Post, Some(id.clone()));
        assert!(fix.invalidator.consume());

        assert!(fix.store.get("user", &id).is_none());
        assert!(fix.queries.lookup(&list_key).is_none());
        assert!(fix.queries.lookup(&preview_key).is_none());
        assert!(fix.queries.lookup(&account_key).is_some());
        assert!(fix.queue.is_empty());
    }

    #[test]
    fn consume_with_empty_queue_reports_no_work() {
        let fix = fixture(CacheSettings::default());

        assert!(!fix.invalidator.consume());
    }

    #[test]
    fn consume_respects_the_batch_limit() {
        let settings = CacheSettings {
            consume_batch_limit: 1,
            ..Default::default()
        };
        let fix = fixture(settings);
        fix.queue.publish("user", OperationKind::Put, None);
        fix.queue.publish("account", OperationKind::Put, None);

        assert!(fix.invalidator.consume());
        assert_eq!(fix.queue.len(), 1);
        assert!(fix.invalidator.consume());
        assert!(fix.queue.is_empty());
        assert!(!fix.invalidator.consume());
    }

    #[test]
    fn consume_all_drains_every_batch() {
        let settings = CacheSettings {
            consume_batch_limit: 1,
            ..Default::default()
        };
        let fix = fixture(settings);
        fix.queue.publish("user", OperationKind::Put, None);
        fix.queue.publish("account", OperationKind::Put, None);

        assert!(fix.invalidator.consume_all());
        assert!(fix.queue.is_empty());
        assert!(!fix.invalidator.consume_all());
    }

    #[test]
    fn a_read_event_without_victims_consumes_but_evicts_nothing() {
        let fix = fixture(CacheSettings::default());
        let id = EntityId::from(7u64);
        fix.store
            .put_value("account", json!({ "id": 7 }))
            .expect("put");

        fix.queue.publish("account", OperationKind::Get, Some(id.clone()));

        assert!(fix.invalidator.consume());
        assert!(fix.store.get("account", &id).is_some());
    }
}
