//! The store of all queries, keyed by hash.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;

use crate::config::QueryOptions;
use crate::environment::Environment;
use crate::error::QueryError;
use crate::filters::QueryFilters;
use crate::observer::QueryObserver;
use crate::query::{Query, QueryAction, QueryState};
use crate::subscription::{ListenerSet, Unsubscribe};

type OnSuccess = Arc<dyn Fn(&Arc<Value>, &Query) + Send + Sync>;
type OnError = Arc<dyn Fn(&QueryError, &Query) + Send + Sync>;
type OnSettled = Arc<dyn Fn(Option<&Arc<Value>>, Option<&QueryError>, &Query) + Send + Sync>;

/// Hooks run for every query in the cache, before observer notification.
#[derive(Clone, Default)]
pub struct QueryCacheConfig {
    pub on_success: Option<OnSuccess>,
    pub on_error: Option<OnError>,
    pub on_settled: Option<OnSettled>,
}

impl fmt::Debug for QueryCacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCacheConfig")
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_settled", &self.on_settled.is_some())
            .finish()
    }
}

/// Events published to cache listeners.
#[derive(Debug, Clone)]
pub enum QueryCacheEvent {
    Added { query: Query },
    Removed { query: Query },
    Updated { query: Query, action: QueryAction },
    ObserverAdded { query: Query, observer: QueryObserver },
    ObserverRemoved { query: Query, observer: QueryObserver },
    ObserverResultsUpdated { query: Query },
    ObserverOptionsUpdated { query: Query, observer: QueryObserver },
}

impl QueryCacheEvent {
    /// The query the event is about.
    #[must_use]
    pub const fn query(&self) -> &Query {
        match self {
            Self::Added { query }
            | Self::Removed { query }
            | Self::Updated { query, .. }
            | Self::ObserverAdded { query, .. }
            | Self::ObserverRemoved { query, .. }
            | Self::ObserverResultsUpdated { query }
            | Self::ObserverOptionsUpdated { query, .. } => query,
        }
    }
}

struct Slot {
    seq: u64,
    query: Query,
}

struct Inner {
    queries: DashMap<String, Slot>,
    next_seq: AtomicU64,
    listeners: ListenerSet<QueryCacheEvent>,
    config: QueryCacheConfig,
    env: Environment,
}

/// Handle to a query cache. Clones share the same store.
#[derive(Clone)]
pub struct QueryCache {
    inner: Arc<Inner>,
}

#[derive(Clone)]
pub(crate) struct WeakQueryCache(Weak<Inner>);

impl WeakQueryCache {
    pub(crate) fn upgrade(&self) -> Option<QueryCache> {
        self.0.upgrade().map(|inner| QueryCache { inner })
    }
}

impl fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryCache")
            .field("queries", &self.inner.queries.len())
            .field("listeners", &self.inner.listeners.len())
            .finish_non_exhaustive()
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCache {
    /// An empty cache with its own isolated environment.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(QueryCacheConfig::default(), Environment::default())
    }

    #[must_use]
    pub fn with_config(config: QueryCacheConfig, env: Environment) -> Self {
        Self {
            inner: Arc::new(Inner {
                queries: DashMap::new(),
                next_seq: AtomicU64::new(0),
                listeners: ListenerSet::new(),
                config,
                env,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &QueryCacheConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn env(&self) -> &Environment {
        &self.inner.env
    }

    pub(crate) fn downgrade(&self) -> WeakQueryCache {
        WeakQueryCache(Arc::downgrade(&self.inner))
    }

    /// Returns the query for the options' hash, creating it if needed.
    ///
    /// `state` only seeds a newly created query.
    pub fn build(&self, options: QueryOptions, state: Option<QueryState>) -> Query {
        let hash = options.hash();
        if let Some(existing) = self.get(&hash) {
            return existing;
        }

        let candidate = Query::new(self.downgrade(), self.inner.env.clone(), options, state);
        let (query, added) = match self.inner.queries.entry(hash) {
            Entry::Occupied(entry) => (entry.get().query.clone(), false),
            Entry::Vacant(entry) => {
                let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
                entry.insert(Slot {
                    seq,
                    query: candidate.clone(),
                });
                (candidate, true)
            }
        };
        if added {
            self.notify(QueryCacheEvent::Added {
                query: query.clone(),
            });
        }
        query
    }

    #[must_use]
    pub fn get(&self, query_hash: &str) -> Option<Query> {
        self.inner
            .queries
            .get(query_hash)
            .map(|slot| slot.query.clone())
    }

    /// All queries, in creation order.
    #[must_use]
    pub fn get_all(&self) -> Vec<Query> {
        let mut slots: Vec<(u64, Query)> = self
            .inner
            .queries
            .iter()
            .map(|slot| (slot.seq, slot.query.clone()))
            .collect();
        slots.sort_by_key(|(seq, _)| *seq);
        slots.into_iter().map(|(_, query)| query).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.queries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.queries.is_empty()
    }

    /// First matching query. Keys match exactly unless `exact` is `Some(false)`.
    pub fn find(&self, filters: &QueryFilters) -> Result<Option<Query>, QueryError> {
        filters.validate()?;
        let mut filters = filters.clone();
        filters.exact.get_or_insert(true);
        Ok(self.get_all().into_iter().find(|query| filters.matches(query)))
    }

    /// Every matching query. Keys are prefix-matched unless `exact` is set.
    pub fn find_all(&self, filters: &QueryFilters) -> Result<Vec<Query>, QueryError> {
        filters.validate()?;
        Ok(self
            .get_all()
            .into_iter()
            .filter(|query| filters.matches(query))
            .collect())
    }

    /// Detaches `query`. It receives no further updates from the cache.
    pub fn remove(&self, query: &Query) {
        let removed = self
            .inner
            .queries
            .remove_if(query.query_hash(), |_, slot| slot.query.ptr_eq(query))
            .is_some();
        if removed {
            query.destroy();
            self.notify(QueryCacheEvent::Removed {
                query: query.clone(),
            });
        }
    }

    /// Removes every query inside one notification batch.
    pub fn clear(&self) {
        self.inner.env.notify.batch(|| {
            for query in self.get_all() {
                self.remove(&query);
            }
        });
    }

    /// Publishes `event` to every listener.
    pub fn notify(&self, event: QueryCacheEvent) {
        self.inner
            .env
            .notify
            .batch(|| self.inner.listeners.emit(&event));
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&QueryCacheEvent) + Send + Sync + 'static,
    ) -> Unsubscribe {
        let id = self.inner.listeners.add(Arc::new(listener));
        let weak = Arc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.remove(id);
            }
        })
    }

    /// Lets every query react to the application regaining focus.
    pub fn on_focus(&self) {
        self.inner.env.notify.batch(|| {
            for query in self.get_all() {
                query.on_focus();
            }
        });
    }

    /// Lets every query react to the network coming back.
    pub fn on_online(&self) {
        self.inner.env.notify.batch(|| {
            for query in self.get_all() {
                query.on_online();
            }
        });
    }
}
