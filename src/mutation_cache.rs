//! The store of all mutations, in submission order.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use tracing::debug;

use crate::config::MutationOptions;
use crate::environment::Environment;
use crate::error::QueryError;
use crate::filters::MutationFilters;
use crate::mutation::{Mutation, MutationAction, MutationState};
use crate::observer::MutationObserver;
use crate::subscription::{ListenerSet, Unsubscribe};
use crate::utils::lock;

type OnMutate = Arc<dyn Fn(&Value, &Mutation) + Send + Sync>;
type OnSuccess = Arc<dyn Fn(&Value, &Value, Option<&Value>, &Mutation) + Send + Sync>;
type OnError = Arc<dyn Fn(&QueryError, &Value, Option<&Value>, &Mutation) + Send + Sync>;
type OnSettled = Arc<
    dyn Fn(Option<&Value>, Option<&QueryError>, &Value, Option<&Value>, &Mutation) + Send + Sync,
>;

/// Hooks run for every mutation, before the mutation's own hooks.
#[derive(Clone, Default)]
pub struct MutationCacheConfig {
    pub on_mutate: Option<OnMutate>,
    pub on_success: Option<OnSuccess>,
    pub on_error: Option<OnError>,
    pub on_settled: Option<OnSettled>,
}

impl fmt::Debug for MutationCacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationCacheConfig")
            .field("on_mutate", &self.on_mutate.is_some())
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_settled", &self.on_settled.is_some())
            .finish()
    }
}

/// Events published to mutation cache listeners.
#[derive(Debug, Clone)]
pub enum MutationCacheEvent {
    Added {
        mutation: Mutation,
    },
    Removed {
        mutation: Mutation,
    },
    Updated {
        mutation: Mutation,
        action: MutationAction,
    },
    ObserverAdded {
        mutation: Mutation,
        observer: MutationObserver,
    },
    ObserverRemoved {
        mutation: Mutation,
        observer: MutationObserver,
    },
    ObserverOptionsUpdated {
        mutation: Option<Mutation>,
        observer: MutationObserver,
    },
}

type Replay = Shared<BoxFuture<'static, ()>>;

struct Inner {
    mutations: Mutex<Vec<Mutation>>,
    next_id: AtomicU64,
    listeners: ListenerSet<MutationCacheEvent>,
    config: MutationCacheConfig,
    env: Environment,
    resuming: Mutex<Option<Replay>>,
}

/// Handle to a mutation cache. Clones share the same store.
#[derive(Clone)]
pub struct MutationCache {
    inner: Arc<Inner>,
}

#[derive(Clone)]
pub(crate) struct WeakMutationCache(Weak<Inner>);

impl WeakMutationCache {
    pub(crate) fn upgrade(&self) -> Option<MutationCache> {
        self.0.upgrade().map(|inner| MutationCache { inner })
    }
}

impl fmt::Debug for MutationCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationCache")
            .field("mutations", &lock(&self.inner.mutations).len())
            .field("listeners", &self.inner.listeners.len())
            .finish_non_exhaustive()
    }
}

impl Default for MutationCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MutationCache {
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MutationCacheConfig::default(), Environment::default())
    }

    #[must_use]
    pub fn with_config(config: MutationCacheConfig, env: Environment) -> Self {
        Self {
            inner: Arc::new(Inner {
                mutations: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                listeners: ListenerSet::new(),
                config,
                env,
                resuming: Mutex::new(None),
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &MutationCacheConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn env(&self) -> &Environment {
        &self.inner.env
    }

    fn downgrade(&self) -> WeakMutationCache {
        WeakMutationCache(Arc::downgrade(&self.inner))
    }

    /// Creates and registers a new mutation. Mutations are never shared.
    pub fn build(&self, options: MutationOptions, state: Option<MutationState>) -> Mutation {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mutation = Mutation::new(
            self.downgrade(),
            self.inner.env.clone(),
            id,
            options,
            state,
        );
        self.add(mutation.clone());
        mutation
    }

    fn add(&self, mutation: Mutation) {
        lock(&self.inner.mutations).push(mutation.clone());
        self.notify(MutationCacheEvent::Added { mutation });
    }

    pub fn remove(&self, mutation: &Mutation) {
        let removed = {
            let mut mutations = lock(&self.inner.mutations);
            let before = mutations.len();
            mutations.retain(|m| !m.ptr_eq(mutation));
            mutations.len() != before
        };
        if removed {
            mutation.clear_gc();
            self.notify(MutationCacheEvent::Removed {
                mutation: mutation.clone(),
            });
        }
    }

    pub fn clear(&self) {
        self.inner.env.notify.batch(|| {
            for mutation in self.get_all() {
                self.remove(&mutation);
            }
        });
    }

    /// All mutations, oldest first.
    #[must_use]
    pub fn get_all(&self) -> Vec<Mutation> {
        lock(&self.inner.mutations).clone()
    }

    /// First matching mutation. Keys match exactly unless `exact` is `Some(false)`.
    pub fn find(&self, filters: &MutationFilters) -> Result<Option<Mutation>, QueryError> {
        filters.validate()?;
        let mut filters = filters.clone();
        filters.exact.get_or_insert(true);
        Ok(self.get_all().into_iter().find(|m| filters.matches(m)))
    }

    pub fn find_all(&self, filters: &MutationFilters) -> Result<Vec<Mutation>, QueryError> {
        filters.validate()?;
        Ok(self
            .get_all()
            .into_iter()
            .filter(|m| filters.matches(m))
            .collect())
    }

    pub fn notify(&self, event: MutationCacheEvent) {
        self.inner
            .env
            .notify
            .batch(|| self.inner.listeners.emit(&event));
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&MutationCacheEvent) + Send + Sync + 'static,
    ) -> Unsubscribe {
        let id = self.inner.listeners.add(Arc::new(listener));
        let weak = Arc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.remove(id);
            }
        })
    }

    /// Replays paused mutations one after another, oldest first.
    ///
    /// Each replay is awaited before the next starts and failures are
    /// swallowed. A call made while a replay is running queues behind it.
    pub fn resume_paused_mutations(&self) -> BoxFuture<'static, ()> {
        let mut resuming = lock(&self.inner.resuming);
        let previous = resuming.take();
        let cache = self.clone();
        let next = async move {
            if let Some(previous) = previous {
                previous.await;
            }
            let paused: Vec<Mutation> = cache
                .get_all()
                .into_iter()
                .filter(|m| m.state().is_paused)
                .collect();
            if !paused.is_empty() {
                debug!(count = paused.len(), "resuming paused mutations");
            }
            for mutation in paused {
                let replay = cache.inner.env.notify.batch(|| mutation.resume());
                if let Err(error) = replay.await {
                    debug!(mutation_id = mutation.mutation_id(), %error, "replayed mutation failed");
                }
            }
        }
        .boxed()
        .shared();
        *resuming = Some(next.clone());
        next.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutation::MutationStatus;
    use serde_json::json;
    use std::time::Duration;

    #[test]
    fn test_ids_increase() {
        let cache = MutationCache::new();
        let first = cache.build(MutationOptions::new(), None);
        let second = cache.build(MutationOptions::new(), None);
        assert!(second.mutation_id() > first.mutation_id());
        assert_eq!(cache.get_all().len(), 2);
    }

    #[test]
    fn test_find_and_remove() {
        let cache = MutationCache::new();
        let add = cache.build(MutationOptions::new().mutation_key("add"), None);
        cache.build(MutationOptions::new().mutation_key(crate::query_key!["add", 1]), None);

        let exact = cache.find(&MutationFilters::key("add")).expect("valid filters");
        assert_eq!(exact, Some(add.clone()));
        let all = cache.find_all(&MutationFilters::key("add")).expect("valid filters");
        assert_eq!(all.len(), 2);

        cache.remove(&add);
        assert_eq!(cache.get_all().len(), 1);
        cache.clear();
        assert!(cache.get_all().is_empty());
    }

    #[test]
    fn test_status_filter() {
        let cache = MutationCache::new();
        let state = MutationState {
            status: MutationStatus::Success,
            ..MutationState::default()
        };
        cache.build(MutationOptions::new(), Some(state));
        cache.build(MutationOptions::new(), None);
        let found = cache
            .find_all(&MutationFilters::all().status(MutationStatus::Success))
            .expect("valid filters");
        assert_eq!(found.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hooks_run_before_mutation_hooks() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let (cache_hook, own_hook) = (Arc::clone(&order), Arc::clone(&order));
        let config = MutationCacheConfig {
            on_success: Some(Arc::new(
                move |_: &Value, _: &Value, _: Option<&Value>, _: &Mutation| {
                    cache_hook.lock().expect("lock").push("cache");
                },
            )),
            ..MutationCacheConfig::default()
        };
        let cache = MutationCache::with_config(config, Environment::default());
        let mutation = cache.build(
            MutationOptions::new()
                .mutation_fn(|v| async move { Ok(v) })
                .on_success(move |_, _, _| own_hook.lock().expect("lock").push("own")),
            None,
        );
        mutation.execute(json!(1)).await.expect("mutation should succeed");
        assert_eq!(*order.lock().expect("lock"), vec!["cache", "own"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_swallows_failures() {
        let cache = MutationCache::new();
        cache.env().online.set_online(false);
        let failing = cache.build(
            MutationOptions::new().mutation_fn(|_| async { Err(QueryError::fetch("nope")) }),
            None,
        );
        let _pending = failing.execute(json!(1));
        tokio::time::sleep(Duration::from_millis(1)).await;
        cache.env().online.set_online(true);

        cache.resume_paused_mutations().await;
        assert_eq!(failing.state().status, MutationStatus::Error);
    }
}
