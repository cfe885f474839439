//! The client facade tying caches, defaults and environment together.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use futures::future;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::config::{MutationOptions, QueryConfig, QueryObserverOptions, RefetchOn};
use crate::environment::Environment;
use crate::error::{CancelOptions, QueryError};
use crate::filters::{MutationFilters, QueryFilters, QueryTypeFilter};
use crate::key::{MutationKey, QueryKey, partial_match_key};
use crate::mutation::MutationStatus;
use crate::mutation_cache::{MutationCache, MutationCacheConfig};
use crate::query::{FetchOptions, FetchStatus, QueryState, SetDataOptions};
use crate::query_cache::{QueryCache, QueryCacheConfig};
use crate::retryer::{NetworkMode, Retry};
use crate::subscription::Unsubscribe;
use crate::timer;
use crate::utils::lock;

/// Everything a [`QueryClient`] is built from.
#[derive(Debug, Clone, Default)]
pub struct QueryClientConfig {
    pub defaults: QueryConfig,
    pub query_cache: QueryCacheConfig,
    pub mutation_cache: MutationCacheConfig,
    /// Notification scheduler and focus/online signals shared by the client.
    pub environment: Environment,
}

/// Which queries `invalidate_queries` refetches afterwards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RefetchType {
    None,
    #[default]
    Active,
    Inactive,
    All,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefetchOptions {
    /// Restart fetches already running. Defaults to `true`.
    pub cancel_refetch: Option<bool>,
    /// Return the first fetch error instead of swallowing it.
    pub throw_on_error: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InvalidateOptions {
    /// Defaults to the filters' `kind`, or active queries.
    pub refetch_type: Option<RefetchType>,
    pub refetch: RefetchOptions,
}

#[derive(Default)]
struct MountState {
    count: usize,
    unsubscribe: Vec<Unsubscribe>,
}

struct ClientInner {
    query_cache: QueryCache,
    mutation_cache: MutationCache,
    config: QueryConfig,
    env: Environment,
    query_defaults: Mutex<Vec<(QueryKey, QueryObserverOptions)>>,
    mutation_defaults: Mutex<Vec<(MutationKey, MutationOptions)>>,
    mount: Mutex<MountState>,
}

/// Entry point to the engine. Clones share the same caches.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryClient")
            .field("query_cache", &self.inner.query_cache)
            .field("mutation_cache", &self.inner.mutation_cache)
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryClient {
    /// A client with default options and its own environment.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(QueryClientConfig::default())
    }

    #[must_use]
    pub fn with_config(config: QueryClientConfig) -> Self {
        let env = config.environment;
        Self {
            inner: Arc::new(ClientInner {
                query_cache: QueryCache::with_config(config.query_cache, env.clone()),
                mutation_cache: MutationCache::with_config(config.mutation_cache, env.clone()),
                config: config.defaults,
                env,
                query_defaults: Mutex::new(Vec::new()),
                mutation_defaults: Mutex::new(Vec::new()),
                mount: Mutex::new(MountState::default()),
            }),
        }
    }

    #[must_use]
    pub fn query_cache(&self) -> &QueryCache {
        &self.inner.query_cache
    }

    #[must_use]
    pub fn mutation_cache(&self) -> &MutationCache {
        &self.inner.mutation_cache
    }

    #[must_use]
    pub fn env(&self) -> &Environment {
        &self.inner.env
    }

    #[must_use]
    pub fn config(&self) -> &QueryConfig {
        &self.inner.config
    }

    /// Starts reacting to focus and connectivity changes.
    ///
    /// Regaining either replays paused mutations, then lets queries refetch
    /// and resume. Mount calls nest; the last `unmount` detaches.
    pub fn mount(&self) {
        let mut mount = lock(&self.inner.mount);
        mount.count += 1;
        if mount.count != 1 {
            return;
        }
        debug!("mounting query client");

        let weak = Arc::downgrade(&self.inner);
        let on_focus = self.inner.env.focus.subscribe(move |focused| {
            if focused {
                if let Some(client) = upgrade(&weak) {
                    client.resume_then(QueryCache::on_focus);
                }
            }
        });
        let weak = Arc::downgrade(&self.inner);
        let on_online = self.inner.env.online.subscribe(move |online| {
            if online {
                if let Some(client) = upgrade(&weak) {
                    client.resume_then(QueryCache::on_online);
                }
            }
        });
        mount.unsubscribe = vec![on_focus, on_online];
    }

    pub fn unmount(&self) {
        let unsubscribe = {
            let mut mount = lock(&self.inner.mount);
            if mount.count == 0 {
                return;
            }
            mount.count -= 1;
            if mount.count != 0 {
                return;
            }
            std::mem::take(&mut mount.unsubscribe)
        };
        debug!("unmounting query client");
        for handle in unsubscribe {
            handle.unsubscribe();
        }
    }

    fn resume_then(&self, then: fn(&QueryCache)) {
        let client = self.clone();
        let spawned = timer::spawn(async move {
            client.resume_paused_mutations().await;
            then(&client.inner.query_cache);
        });
        if !spawned {
            then(&self.inner.query_cache);
        }
    }

    /// Number of queries currently fetching.
    pub fn is_fetching(&self, filters: &QueryFilters) -> Result<usize, QueryError> {
        let filters = filters.clone().fetch_status(FetchStatus::Fetching);
        Ok(self.inner.query_cache.find_all(&filters)?.len())
    }

    /// Number of mutations currently pending.
    pub fn is_mutating(&self, filters: &MutationFilters) -> Result<usize, QueryError> {
        let filters = filters.clone().status(MutationStatus::Pending);
        Ok(self.inner.mutation_cache.find_all(&filters)?.len())
    }

    #[must_use]
    pub fn get_query_data(&self, key: impl Into<QueryKey>) -> Option<Arc<Value>> {
        self.inner
            .query_cache
            .get(&key.into().hash())
            .and_then(|query| query.state().data)
    }

    /// Cached data decoded into `T`.
    pub fn get_query_data_as<T: DeserializeOwned>(
        &self,
        key: impl Into<QueryKey>,
    ) -> Result<Option<T>, QueryError> {
        self.get_query_data(key)
            .map(|data| {
                serde_json::from_value((*data).clone()).map_err(|e| QueryError::Decode(e.to_string()))
            })
            .transpose()
    }

    pub fn get_queries_data(
        &self,
        filters: &QueryFilters,
    ) -> Result<Vec<(QueryKey, Option<Arc<Value>>)>, QueryError> {
        Ok(self
            .inner
            .query_cache
            .find_all(filters)?
            .into_iter()
            .map(|query| (query.query_key().clone(), query.state().data))
            .collect())
    }

    /// Writes data computed from the cached data, creating the query if
    /// needed. Returning `None` from `updater` leaves the cache untouched.
    pub fn set_query_data(
        &self,
        key: impl Into<QueryKey>,
        updater: impl FnOnce(Option<&Arc<Value>>) -> Option<Value>,
    ) -> Option<Arc<Value>> {
        let options = self.default_query_options(QueryObserverOptions::new(key));
        let previous = self.inner.query_cache.get(&options.query.hash());
        let previous_data = previous.and_then(|query| query.state().data);
        let data = updater(previous_data.as_ref())?;
        let query = self.inner.query_cache.build(options.query, None);
        Some(query.set_data(
            data,
            SetDataOptions {
                updated_at: None,
                manual: true,
            },
        ))
    }

    /// Applies `updater` to every matching query, inside one batch.
    pub fn set_queries_data(
        &self,
        filters: &QueryFilters,
        updater: impl Fn(Option<&Arc<Value>>) -> Option<Value>,
    ) -> Result<Vec<(QueryKey, Option<Arc<Value>>)>, QueryError> {
        let queries = self.inner.query_cache.find_all(filters)?;
        Ok(self.inner.env.notify.batch(|| {
            queries
                .into_iter()
                .map(|query| {
                    let key = query.query_key().clone();
                    let data = self.set_query_data(key.clone(), &updater);
                    (key, data)
                })
                .collect()
        }))
    }

    #[must_use]
    pub fn get_query_state(&self, key: impl Into<QueryKey>) -> Option<QueryState> {
        self.inner
            .query_cache
            .get(&key.into().hash())
            .map(|query| query.state())
    }

    /// Returns cached data, fetching only when there is none.
    pub async fn ensure_query_data(
        &self,
        options: impl Into<QueryObserverOptions>,
    ) -> Result<Arc<Value>, QueryError> {
        let options = options.into();
        match self.get_query_data(options.query.query_key.clone()) {
            Some(data) => Ok(data),
            None => self.fetch_query(options).await,
        }
    }

    /// Fetches unless the cached data is fresh for the given `stale_time`.
    ///
    /// Retries default to none here unless set explicitly.
    pub async fn fetch_query(
        &self,
        options: impl Into<QueryObserverOptions>,
    ) -> Result<Arc<Value>, QueryError> {
        let mut options = options.into();
        self.apply_query_defaults(&mut options);
        options.query.retry.get_or_insert(Retry::Never);
        let options = self.finish_query_defaults(options);

        let query = self.inner.query_cache.build(options.query.clone(), None);
        if !query.is_stale_by_time(options.stale_time_or_default()) {
            if let Some(data) = query.state().data {
                return Ok(data);
            }
        }
        query
            .fetch(Some(options.query), FetchOptions::default())
            .await
    }

    /// Like [`Self::fetch_query`], discarding the outcome.
    pub async fn prefetch_query(&self, options: impl Into<QueryObserverOptions>) {
        if let Err(error) = self.fetch_query(options).await {
            debug!(%error, "prefetch failed");
        }
    }

    /// Marks matching queries stale, then refetches per `refetch_type`.
    pub async fn invalidate_queries(
        &self,
        filters: &QueryFilters,
        options: InvalidateOptions,
    ) -> Result<(), QueryError> {
        let queries = self.inner.query_cache.find_all(filters)?;
        self.inner.env.notify.batch(|| {
            for query in &queries {
                query.invalidate();
            }
        });

        let kind = match options.refetch_type {
            Some(RefetchType::None) => return Ok(()),
            Some(RefetchType::Active) => QueryTypeFilter::Active,
            Some(RefetchType::Inactive) => QueryTypeFilter::Inactive,
            Some(RefetchType::All) => QueryTypeFilter::All,
            None => match filters.kind {
                QueryTypeFilter::All => QueryTypeFilter::Active,
                kind => kind,
            },
        };
        self.refetch_queries(&filters.clone().kind(kind), options.refetch)
            .await
    }

    /// Refetches every matching query that is not disabled.
    ///
    /// Paused fetches are not waited for.
    pub async fn refetch_queries(
        &self,
        filters: &QueryFilters,
        options: RefetchOptions,
    ) -> Result<(), QueryError> {
        let fetch_options = FetchOptions {
            cancel_refetch: options.cancel_refetch.unwrap_or(true),
        };
        let queries = self.inner.query_cache.find_all(filters)?;
        let promises: Vec<_> = self.inner.env.notify.batch(|| {
            queries
                .iter()
                .filter(|query| !query.is_disabled())
                .filter_map(|query| {
                    let promise = query.fetch(None, fetch_options);
                    (query.state().fetch_status != FetchStatus::Paused).then_some(promise)
                })
                .collect()
        });

        let results = future::join_all(promises).await;
        if options.throw_on_error {
            if let Some(Err(error)) = results.into_iter().find(Result::is_err) {
                return Err(error);
            }
        }
        Ok(())
    }

    /// Cancels matching fetches, reverting to the state before each fetch.
    pub async fn cancel_queries(&self, filters: &QueryFilters) -> Result<(), QueryError> {
        self.cancel_queries_with(filters, CancelOptions::revert())
            .await
    }

    pub async fn cancel_queries_with(
        &self,
        filters: &QueryFilters,
        options: CancelOptions,
    ) -> Result<(), QueryError> {
        let queries = self.inner.query_cache.find_all(filters)?;
        let cancels: Vec<_> = self
            .inner
            .env
            .notify
            .batch(|| queries.iter().map(|query| query.cancel(options)).collect());
        future::join_all(cancels).await;
        Ok(())
    }

    pub fn remove_queries(&self, filters: &QueryFilters) -> Result<(), QueryError> {
        let queries = self.inner.query_cache.find_all(filters)?;
        self.inner.env.notify.batch(|| {
            for query in &queries {
                self.inner.query_cache.remove(query);
            }
        });
        Ok(())
    }

    /// Resets matching queries to their initial state and refetches the
    /// active ones.
    pub async fn reset_queries(
        &self,
        filters: &QueryFilters,
        options: RefetchOptions,
    ) -> Result<(), QueryError> {
        let queries = self.inner.query_cache.find_all(filters)?;
        self.inner.env.notify.batch(|| {
            for query in &queries {
                query.reset();
            }
        });
        self.refetch_queries(&filters.clone().kind(QueryTypeFilter::Active), options)
            .await
    }

    /// Replays paused mutations if the client is online.
    pub async fn resume_paused_mutations(&self) {
        if self.inner.env.online.is_online() {
            self.inner.mutation_cache.resume_paused_mutations().await;
        }
    }

    /// Empties both caches.
    pub fn clear(&self) {
        self.inner.query_cache.clear();
        self.inner.mutation_cache.clear();
    }

    /// Registers defaults for every query whose key starts with `key`.
    pub fn set_query_defaults(&self, key: impl Into<QueryKey>, options: QueryObserverOptions) {
        let key = key.into();
        let mut defaults = lock(&self.inner.query_defaults);
        match defaults.iter_mut().find(|(k, _)| k.hash() == key.hash()) {
            Some(entry) => entry.1 = options,
            None => defaults.push((key, options)),
        }
    }

    /// Defaults registered for keys that prefix `key`, later ones winning.
    #[must_use]
    pub fn get_query_defaults(&self, key: &QueryKey) -> QueryObserverOptions {
        let mut merged = QueryObserverOptions::default();
        for (prefix, options) in lock(&self.inner.query_defaults).iter().rev() {
            if partial_match_key(key, prefix) {
                merged.merge_from(options);
            }
        }
        merged
    }

    pub fn set_mutation_defaults(&self, key: impl Into<MutationKey>, options: MutationOptions) {
        let key = key.into();
        let mut defaults = lock(&self.inner.mutation_defaults);
        match defaults.iter_mut().find(|(k, _)| k.hash() == key.hash()) {
            Some(entry) => entry.1 = options,
            None => defaults.push((key, options)),
        }
    }

    #[must_use]
    pub fn get_mutation_defaults(&self, key: &MutationKey) -> MutationOptions {
        let mut merged = MutationOptions::default();
        for (prefix, options) in lock(&self.inner.mutation_defaults).iter().rev() {
            if partial_match_key(key, prefix) {
                merged.merge_from(options);
            }
        }
        merged
    }

    /// Fills unset options from per-key defaults, then client defaults.
    #[must_use]
    pub fn default_query_options(&self, mut options: QueryObserverOptions) -> QueryObserverOptions {
        self.apply_query_defaults(&mut options);
        self.finish_query_defaults(options)
    }

    fn apply_query_defaults(&self, options: &mut QueryObserverOptions) {
        let defaults = self.get_query_defaults(&options.query.query_key);
        options.merge_from(&defaults);
    }

    fn finish_query_defaults(&self, mut options: QueryObserverOptions) -> QueryObserverOptions {
        if options.refetch_on_reconnect.is_none()
            && options.query.network_mode == Some(NetworkMode::Always)
        {
            options.refetch_on_reconnect = Some(RefetchOn::Never);
        }
        options.merge_config(&self.inner.config);
        options
    }

    #[must_use]
    pub fn default_mutation_options(&self, mut options: MutationOptions) -> MutationOptions {
        if let Some(key) = &options.mutation_key {
            let defaults = self.get_mutation_defaults(key);
            options.merge_from(&defaults);
        }
        options.merge_config(&self.inner.config);
        options
    }
}

fn upgrade(weak: &Weak<ClientInner>) -> Option<QueryClient> {
    weak.upgrade().map(|inner| QueryClient { inner })
}
