//! Query result cache with request coalescing.
//!
//! Results of decorated reads are cached by call fingerprint. Concurrent
//! reads of one fingerprint share a single upstream call: the first caller
//! installs an in-flight slot holding a shared future and later callers
//! await that same future. Invalidation drops settled and in-flight slots
//! alike; coalesced callers still receive their result, it is simply not
//! cached.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use lru::LruCache;
use metrics::counter;
use serde_json::Value;
use tracing::debug;

use crate::config::CacheSettings;
use crate::error::CacheError;
use crate::keys::QueryKey;
use crate::lock::{rw_read, rw_write};
use crate::registry::TouchIndex;

const SOURCE: &str = "query";

const METRIC_QUERY_HIT_TOTAL: &str = "dispensa_query_hit_total";
const METRIC_QUERY_MISS_TOTAL: &str = "dispensa_query_miss_total";
const METRIC_QUERY_EVICT_TOTAL: &str = "dispensa_query_evict_total";

type SharedProducer = Shared<BoxFuture<'static, Result<Arc<Value>, CacheError>>>;

/// A settled query result with its freshness stamp.
#[derive(Debug, Clone)]
pub struct QueryEntry {
    pub result: Arc<Value>,
    /// Entity types whose invalidation evicts this entry.
    pub touches: HashSet<String>,
    pub expires_at: Option<Instant>,
}

impl QueryEntry {
    /// Whether the entry is still fresh at `now`.
    pub fn is_fresh(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| now < deadline)
    }
}

/// One cached fingerprint: settled, or still being produced.
///
/// The flight id ties an in-flight reservation to its completion. When the
/// reservation is invalidated or evicted mid-flight the id no longer
/// matches and the completion skips caching. An abandoned in-flight slot
/// is harmless: the next reader of the key joins the pending future and
/// drives it to completion.
enum Slot {
    Ready(QueryEntry),
    InFlight { flight: u64, shared: SharedProducer },
}

struct QueryState {
    slots: LruCache<QueryKey, Slot>,
    index: TouchIndex,
    next_flight: u64,
}

enum Pending {
    Join(SharedProducer),
    Lead { flight: u64, shared: SharedProducer },
}

enum Probe {
    Hit(Arc<Value>),
    Join(SharedProducer),
    Vacant,
}

/// Cache of decorated read results keyed by call fingerprint.
///
/// One lock guards entries and touch index together so invalidation always
/// observes them as a consistent pair. The lock is never held across an
/// await.
pub struct QueryCache {
    state: RwLock<QueryState>,
}

impl QueryCache {
    pub fn new(settings: &CacheSettings) -> Self {
        Self {
            state: RwLock::new(QueryState {
                slots: LruCache::new(settings.query_limit_non_zero()),
                index: TouchIndex::new(),
                next_flight: 0,
            }),
        }
    }

    /// Serve the fingerprint from cache, or produce it upstream.
    ///
    /// On a miss the key is reserved before `produce` runs; every
    /// concurrent caller for the same key awaits the same shared future,
    /// so at most one upstream call is in flight per fingerprint. Success
    /// settles the entry with `touches` registered and `ttl` stamped at
    /// completion. Failure releases the reservation so a later read can
    /// retry, and the error reaches every coalesced caller.
    pub async fn read<F>(
        &self,
        key: QueryKey,
        touches: HashSet<String>,
        ttl: Option<Duration>,
        produce: F,
    ) -> Result<Arc<Value>, CacheError>
    where
        F: Future<Output = Result<Arc<Value>, CacheError>> + Send + 'static,
    {
        let pending = {
            let mut state = rw_write(&self.state, SOURCE, "read");
            let now = Instant::now();

            let probe = match state.slots.get(&key) {
                Some(Slot::Ready(entry)) if entry.is_fresh(now) => {
                    Probe::Hit(Arc::clone(&entry.result))
                }
                Some(Slot::InFlight { shared, .. }) => Probe::Join(shared.clone()),
                _ => Probe::Vacant,
            };

            match probe {
                Probe::Hit(result) => {
                    counter!(METRIC_QUERY_HIT_TOTAL).increment(1);
                    debug!(key = %key, outcome = "hit", "query cache");
                    return Ok(result);
                }
                Probe::Join(shared) => {
                    counter!(METRIC_QUERY_HIT_TOTAL).increment(1);
                    debug!(key = %key, outcome = "join", "query cache");
                    Pending::Join(shared)
                }
                Probe::Vacant => {
                    counter!(METRIC_QUERY_MISS_TOTAL).increment(1);
                    debug!(key = %key, outcome = "miss", "query cache");

                    let flight = state.next_flight;
                    state.next_flight += 1;
                    let shared: SharedProducer = produce.boxed().shared();

                    state.index.register(key.clone(), touches);
                    let installed = Slot::InFlight {
                        flight,
                        shared: shared.clone(),
                    };
                    if let Some((evicted_key, _)) = state.slots.push(key.clone(), installed)
                        && evicted_key != key
                    {
                        state.index.unregister(&evicted_key);
                        counter!(METRIC_QUERY_EVICT_TOTAL).increment(1);
                        debug!(key = %evicted_key, "query entry evicted at capacity");
                    }

                    Pending::Lead { flight, shared }
                }
            }
        };

        match pending {
            Pending::Join(shared) => shared.await,
            Pending::Lead { flight, shared } => {
                let outcome = shared.await;
                match &outcome {
                    Ok(result) => self.complete(&key, flight, Arc::clone(result), ttl),
                    Err(_) => self.release(&key, flight),
                }
                outcome
            }
        }
    }

    /// Settle a reservation, unless it was lost mid-flight.
    fn complete(&self, key: &QueryKey, flight: u64, result: Arc<Value>, ttl: Option<Duration>) {
        let mut state = rw_write(&self.state, SOURCE, "complete");
        let current = matches!(
            state.slots.peek(key),
            Some(Slot::InFlight { flight: active, .. }) if *active == flight
        );
        if !current {
            debug!(key = %key, "query result not cached, reservation lost");
            return;
        }

        let entry = QueryEntry {
            result,
            touches: state.index.types_for_key(key),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        state.slots.put(key.clone(), Slot::Ready(entry));
    }

    /// Drop a failed reservation so the next read can retry.
    fn release(&self, key: &QueryKey, flight: u64) {
        let mut state = rw_write(&self.state, SOURCE, "release");
        let current = matches!(
            state.slots.peek(key),
            Some(Slot::InFlight { flight: active, .. }) if *active == flight
        );
        if current {
            state.slots.pop(key);
            state.index.unregister(key);
        }
    }

    /// Fresh settled result for the key, when one is cached.
    ///
    /// An expired entry is removed on observation.
    pub fn lookup(&self, key: &QueryKey) -> Option<Arc<Value>> {
        let mut state = rw_write(&self.state, SOURCE, "lookup");
        let now = Instant::now();

        let settled = match state.slots.get(key) {
            Some(Slot::Ready(entry)) => Some((entry.is_fresh(now), Arc::clone(&entry.result))),
            _ => None,
        };
        match settled {
            Some((true, result)) => Some(result),
            Some((false, _)) => {
                state.slots.pop(key);
                state.index.unregister(key);
                None
            }
            None => None,
        }
    }

    /// Evict every cached query touching the given entity type.
    ///
    /// Returns the number of evicted slots, in-flight reservations
    /// included.
    pub fn invalidate(&self, entity_type: &str) -> usize {
        let mut state = rw_write(&self.state, SOURCE, "invalidate");
        let keys = state.index.keys_for_type(entity_type);
        for key in &keys {
            state.slots.pop(key);
            state.index.unregister(key);
        }
        if !keys.is_empty() {
            debug!(entity_type, evicted = keys.len(), "query entries invalidated");
        }
        keys.len()
    }

    /// Evict every cached query regardless of what it touches.
    ///
    /// Returns the number of evicted slots, in-flight reservations
    /// included. Producers already running keep going; their results
    /// still reach waiters but are not written back.
    pub fn invalidate_all(&self) -> usize {
        let mut state = rw_write(&self.state, SOURCE, "invalidate_all");
        let evicted = state.slots.len();
        state.slots.clear();
        state.index.clear();
        if evicted > 0 {
            debug!(evicted, "query cache invalidated wholesale");
        }
        evicted
    }

    /// Drop every entry and index mapping.
    pub fn clear(&self) {
        let mut state = rw_write(&self.state, SOURCE, "clear");
        state.slots.clear();
        state.index.clear();
    }

    /// Number of slots currently held, in-flight reservations included.
    pub fn len(&self) -> usize {
        rw_read(&self.state, SOURCE, "len").slots.len()
    }

    /// Check if the cache holds no slots.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
