//! The cached query entity.
//!
//! A [`Query`] owns the state of one key: its data, error and fetch status.
//! State only changes through [`QueryAction`]s applied by a reducer; every
//! applied action is fanned out to the query's observers and to the cache
//! listeners inside one notification batch.
//!
//! At most one fetch runs per query. Calling [`Query::fetch`] while a fetch
//! is in flight returns the in-flight promise.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{DEFAULT_GC_TIME, QueryFn, QueryOptions};
use crate::environment::Environment;
use crate::error::{CancelOptions, QueryError};
use crate::key::QueryKey;
use crate::observer::{QueryObserver, WeakQueryObserver};
use crate::query_cache::{QueryCache, QueryCacheEvent, WeakQueryCache};
use crate::retryer::{Operation, Promise, Retry, Retryer, RetryerConfig, can_fetch};
use crate::timer::{self, TimeoutHandle};
use crate::utils::{lock, now_millis, replace_data, time_until_stale};

/// Whether a query has data, an error, or neither yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryStatus {
    #[default]
    Pending,
    Success,
    Error,
}

/// Whether the query function is running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FetchStatus {
    #[default]
    Idle,
    Fetching,
    /// A fetch wants to run but is waiting for focus or connectivity.
    Paused,
}

/// Snapshot of a query. Timestamps are milliseconds since the Unix epoch,
/// `0` meaning "never".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryState {
    pub data: Option<Arc<Value>>,
    pub data_update_count: u32,
    pub data_updated_at: u64,
    pub error: Option<QueryError>,
    pub error_update_count: u32,
    pub error_updated_at: u64,
    pub fetch_failure_count: u32,
    pub fetch_failure_reason: Option<QueryError>,
    pub is_invalidated: bool,
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
}

impl QueryState {
    /// The state a query starts in, seeded from `initial_data` if present.
    #[must_use]
    pub fn initial(options: &QueryOptions) -> Self {
        match &options.initial_data {
            Some(data) => Self {
                data: Some(Arc::new(data.clone())),
                data_updated_at: options.initial_data_updated_at.unwrap_or_else(now_millis),
                status: QueryStatus::Success,
                ..Self::default()
            },
            None => Self::default(),
        }
    }
}

/// State transitions of a query.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryAction {
    Fetch,
    Failed {
        failure_count: u32,
        error: QueryError,
    },
    Success {
        data: Arc<Value>,
        data_updated_at: Option<u64>,
        manual: bool,
    },
    Error {
        error: QueryError,
    },
    Invalidate,
    Pause,
    Continue,
    SetState {
        state: Box<QueryState>,
    },
}

/// Argument passed to a query function.
#[derive(Clone)]
pub struct QueryFunctionContext {
    pub query_key: QueryKey,
    pub meta: Option<Value>,
    signal: CancellationToken,
    signal_consumed: Arc<AtomicBool>,
}

impl fmt::Debug for QueryFunctionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryFunctionContext")
            .field("query_key", &self.query_key)
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

impl QueryFunctionContext {
    /// A context detached from any query.
    #[must_use]
    pub fn new(query_key: QueryKey, meta: Option<Value>) -> Self {
        Self {
            query_key,
            meta,
            signal: CancellationToken::new(),
            signal_consumed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Token cancelled when the fetch is cancelled.
    ///
    /// Taking the signal tells the query that the function honours
    /// cancellation, so an abandoned fetch is cancelled (and reverted)
    /// instead of being left to finish in the background.
    #[must_use]
    pub fn signal(&self) -> CancellationToken {
        self.signal_consumed.store(true, Ordering::SeqCst);
        self.signal.clone()
    }
}

/// Options of [`Query::fetch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    /// Cancel a running fetch and start over, if the query has data.
    pub cancel_refetch: bool,
}

/// Options of [`Query::set_data`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetDataOptions {
    pub updated_at: Option<u64>,
    /// Manual updates leave the fetch status alone.
    pub manual: bool,
}

struct QueryInner {
    query_key: QueryKey,
    query_hash: String,
    cache: WeakQueryCache,
    env: Environment,
    initial_state: QueryState,
    state: Mutex<QueryState>,
    options: Mutex<QueryOptions>,
    gc_time: Mutex<Duration>,
    revert_state: Mutex<Option<QueryState>>,
    observers: Mutex<Vec<WeakQueryObserver>>,
    retryer: Mutex<Option<Retryer<Arc<Value>>>>,
    gc: Mutex<Option<TimeoutHandle>>,
    signal_consumed: Arc<AtomicBool>,
}

/// Handle to a cached query. Clones refer to the same entity.
#[derive(Clone)]
pub struct Query {
    inner: Arc<QueryInner>,
}

impl fmt::Debug for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("query_hash", &self.inner.query_hash)
            .field("state", &*lock(&self.inner.state))
            .finish_non_exhaustive()
    }
}

impl PartialEq for Query {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Query {}

impl Query {
    pub(crate) fn new(
        cache: WeakQueryCache,
        env: Environment,
        options: QueryOptions,
        state: Option<QueryState>,
    ) -> Self {
        let initial_state = QueryState::initial(&options);
        let query = Self {
            inner: Arc::new(QueryInner {
                query_key: options.query_key.clone(),
                query_hash: options.hash(),
                cache,
                env,
                state: Mutex::new(state.unwrap_or_else(|| initial_state.clone())),
                initial_state,
                gc_time: Mutex::new(options.gc_time.unwrap_or(DEFAULT_GC_TIME)),
                options: Mutex::new(options),
                revert_state: Mutex::new(None),
                observers: Mutex::new(Vec::new()),
                retryer: Mutex::new(None),
                gc: Mutex::new(None),
                signal_consumed: Arc::new(AtomicBool::new(false)),
            }),
        };
        query.schedule_gc();
        query
    }

    #[must_use]
    pub fn query_key(&self) -> &QueryKey {
        &self.inner.query_key
    }

    #[must_use]
    pub fn query_hash(&self) -> &str {
        &self.inner.query_hash
    }

    #[must_use]
    pub fn state(&self) -> QueryState {
        lock(&self.inner.state).clone()
    }

    #[must_use]
    pub fn options(&self) -> QueryOptions {
        lock(&self.inner.options).clone()
    }

    #[must_use]
    pub fn meta(&self) -> Option<Value> {
        lock(&self.inner.options).meta.clone()
    }

    #[must_use]
    pub fn gc_time(&self) -> Duration {
        *lock(&self.inner.gc_time)
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn cache(&self) -> Option<QueryCache> {
        self.inner.cache.upgrade()
    }

    /// Replaces the options, keeping anything the new ones leave unset.
    ///
    /// The GC time only ever grows.
    pub fn set_options(&self, mut options: QueryOptions) {
        let mut current = lock(&self.inner.options);
        options.merge_from(&current);
        if let Some(gc_time) = options.gc_time {
            let mut current_gc = lock(&self.inner.gc_time);
            *current_gc = (*current_gc).max(gc_time);
        }
        *current = options;
    }

    /// Replaces the data, applying structural sharing. Returns the stored
    /// value, which is the previous `Arc` when nothing changed.
    pub fn set_data(&self, data: impl Into<Arc<Value>>, options: SetDataOptions) -> Arc<Value> {
        let sharing = lock(&self.inner.options)
            .structural_sharing
            .clone()
            .unwrap_or_default();
        let previous = lock(&self.inner.state).data.clone();
        let data = replace_data(previous.as_ref(), data.into(), &sharing);
        self.dispatch(QueryAction::Success {
            data: Arc::clone(&data),
            data_updated_at: options.updated_at,
            manual: options.manual,
        });
        data
    }

    /// Overwrites the whole state.
    pub fn set_state(&self, state: QueryState) {
        self.dispatch(QueryAction::SetState {
            state: Box::new(state),
        });
    }

    /// Cancels a running fetch. Resolves once the fetch has settled.
    pub fn cancel(&self, options: CancelOptions) -> BoxFuture<'static, ()> {
        let retryer = lock(&self.inner.retryer).clone();
        match retryer {
            Some(retryer) => {
                retryer.cancel(options);
                let promise = retryer.promise();
                async move {
                    let _ = promise.await;
                }
                .boxed()
            }
            None => future::ready(()).boxed(),
        }
    }

    /// Stops the GC timer and silently cancels any running fetch.
    pub fn destroy(&self) {
        self.clear_gc();
        let _ = self.cancel(CancelOptions::silent());
    }

    /// Restores the state the query was created with.
    pub fn reset(&self) {
        self.destroy();
        self.set_state(self.inner.initial_state.clone());
    }

    /// Marks the data as stale regardless of its age.
    pub fn invalidate(&self) {
        if !lock(&self.inner.state).is_invalidated {
            self.dispatch(QueryAction::Invalidate);
        }
    }

    /// `true` if any enabled observer watches this query.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.observers()
            .iter()
            .any(|observer| observer.options().is_enabled())
    }

    /// `true` if nothing would fetch this query on its own.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        if self.observer_count() > 0 {
            return !self.is_active();
        }
        let state = lock(&self.inner.state);
        state.data_update_count + state.error_update_count == 0
    }

    /// Stale if invalidated, without data, or stale for any observer.
    #[must_use]
    pub fn is_stale(&self) -> bool {
        {
            let state = lock(&self.inner.state);
            if state.is_invalidated || state.data.is_none() {
                return true;
            }
        }
        self.observers()
            .iter()
            .any(QueryObserver::current_result_is_stale)
    }

    /// Stale if invalidated, without data, or older than `stale_time`.
    #[must_use]
    pub fn is_stale_by_time(&self, stale_time: Duration) -> bool {
        let state = lock(&self.inner.state);
        state.is_invalidated
            || state.data.is_none()
            || time_until_stale(state.data_updated_at, stale_time).is_zero()
    }

    #[must_use]
    pub fn observer_count(&self) -> usize {
        lock(&self.inner.observers).len()
    }

    /// Live observers, in subscription order.
    pub(crate) fn observers(&self) -> Vec<QueryObserver> {
        lock(&self.inner.observers)
            .iter()
            .filter_map(WeakQueryObserver::upgrade)
            .collect()
    }

    pub(crate) fn add_observer(&self, observer: &QueryObserver) {
        {
            let mut observers = lock(&self.inner.observers);
            if observers.iter().any(|weak| weak.id() == observer.id()) {
                return;
            }
            observers.push(observer.downgrade());
        }
        self.clear_gc();
        if let Some(cache) = self.cache() {
            cache.notify(QueryCacheEvent::ObserverAdded {
                query: self.clone(),
                observer: observer.clone(),
            });
        }
    }

    pub(crate) fn remove_observer(&self, observer: &QueryObserver) {
        if !self.detach_observer(observer.id()) {
            return;
        }
        if let Some(cache) = self.cache() {
            cache.notify(QueryCacheEvent::ObserverRemoved {
                query: self.clone(),
                observer: observer.clone(),
            });
        }
    }

    /// Drops the observer with `id`. Returns `false` if it was not attached.
    ///
    /// When the last observer leaves, retries stop (or the fetch is
    /// cancelled, if the query function took its signal) and GC is armed.
    pub(crate) fn detach_observer(&self, id: u64) -> bool {
        let now_empty = {
            let mut observers = lock(&self.inner.observers);
            let before = observers.len();
            observers.retain(|weak| weak.id() != id);
            if observers.len() == before {
                return false;
            }
            observers.is_empty()
        };

        if now_empty {
            let retryer = lock(&self.inner.retryer).clone();
            if let Some(retryer) = retryer {
                if self.inner.signal_consumed.load(Ordering::SeqCst) {
                    retryer.cancel(CancelOptions::revert());
                } else {
                    retryer.cancel_retry();
                }
            }
            self.schedule_gc();
        }
        true
    }

    /// Refetches through the first observer that wants a refetch on focus,
    /// then wakes a paused fetch.
    pub fn on_focus(&self) {
        if let Some(observer) = self
            .observers()
            .into_iter()
            .find(QueryObserver::should_fetch_on_window_focus)
        {
            observer.refetch_in_background();
        }
        self.try_resume();
    }

    /// Like [`Self::on_focus`], for reconnects.
    pub fn on_online(&self) {
        if let Some(observer) = self
            .observers()
            .into_iter()
            .find(QueryObserver::should_fetch_on_reconnect)
        {
            observer.refetch_in_background();
        }
        self.try_resume();
    }

    fn try_resume(&self) {
        let retryer = lock(&self.inner.retryer).clone();
        if let Some(retryer) = retryer {
            retryer.try_resume();
        }
    }

    /// Starts a fetch, or joins the one in flight.
    ///
    /// A running fetch is restarted instead when `cancel_refetch` is set and
    /// the query already has data.
    pub fn fetch(
        &self,
        options: Option<QueryOptions>,
        fetch_options: FetchOptions,
    ) -> Promise<Arc<Value>> {
        let (fetching, has_data) = {
            let state = lock(&self.inner.state);
            (state.fetch_status != FetchStatus::Idle, state.data.is_some())
        };
        if fetching {
            let retryer = lock(&self.inner.retryer).clone();
            if has_data && fetch_options.cancel_refetch {
                if let Some(retryer) = &retryer {
                    retryer.cancel(CancelOptions::silent());
                }
            } else if let Some(retryer) = retryer {
                retryer.continue_retry();
                return retryer.promise();
            }
        }

        if let Some(options) = options {
            self.set_options(options);
        }
        let query_fn = self.resolve_query_fn();
        let options = self.options();

        let Some(query_fn) = query_fn else {
            let error = QueryError::MissingQueryFn {
                hash: self.inner.query_hash.clone(),
            };
            self.on_fetch_error(&error);
            return future::ready(Err(error)).boxed().shared();
        };

        let snapshot = self.state();
        let start_fetch = snapshot.fetch_status == FetchStatus::Idle;
        *lock(&self.inner.revert_state) = Some(snapshot);
        if start_fetch {
            self.dispatch(QueryAction::Fetch);
        }
        debug!(query_hash = %self.inner.query_hash, "fetching query");

        let retryer = Retryer::new(self.retryer_config(query_fn, &options));
        *lock(&self.inner.retryer) = Some(retryer.clone());
        retryer.start();
        retryer.promise()
    }

    fn resolve_query_fn(&self) -> Option<QueryFn> {
        if let Some(query_fn) = lock(&self.inner.options).query_fn.clone() {
            return Some(query_fn);
        }
        let borrowed = self
            .observers()
            .into_iter()
            .find_map(|observer| observer.options().query.query_fn);
        if let Some(query_fn) = &borrowed {
            lock(&self.inner.options).query_fn = Some(Arc::clone(query_fn));
        }
        borrowed
    }

    fn retryer_config(&self, query_fn: QueryFn, options: &QueryOptions) -> RetryerConfig<Arc<Value>> {
        let query_key = self.inner.query_key.clone();
        let meta = options.meta.clone();
        let consumed = Arc::clone(&self.inner.signal_consumed);
        let operation: Operation<Arc<Value>> = Arc::new(move |signal| {
            consumed.store(false, Ordering::SeqCst);
            let context = QueryFunctionContext {
                query_key: query_key.clone(),
                meta: meta.clone(),
                signal,
                signal_consumed: Arc::clone(&consumed),
            };
            query_fn(context).map(|result| result.map(Arc::new)).boxed()
        });

        let weak = Arc::downgrade(&self.inner);
        let mut config = RetryerConfig::new(
            operation,
            self.inner.env.focus.clone(),
            self.inner.env.online.clone(),
        );
        config.retry = options.retry.clone().unwrap_or(Retry::Count(3));
        config.retry_delay = options.retry_delay.clone().unwrap_or_default();
        config.network_mode = options.network_mode.unwrap_or_default();
        config.on_success = Some(Box::new({
            let weak = weak.clone();
            move |data: &Arc<Value>| {
                if let Some(query) = upgrade(&weak) {
                    query.on_fetch_success(data);
                }
            }
        }));
        config.on_error = Some(Box::new({
            let weak = weak.clone();
            move |error: &QueryError| {
                if let Some(query) = upgrade(&weak) {
                    query.on_fetch_error(error);
                }
            }
        }));
        config.on_fail = Some(Arc::new({
            let weak = weak.clone();
            move |failure_count, error: &QueryError| {
                if let Some(query) = upgrade(&weak) {
                    query.dispatch(QueryAction::Failed {
                        failure_count,
                        error: error.clone(),
                    });
                }
            }
        }));
        config.on_pause = Some(Arc::new({
            let weak = weak.clone();
            move || {
                if let Some(query) = upgrade(&weak) {
                    query.dispatch(QueryAction::Pause);
                }
            }
        }));
        config.on_continue = Some(Arc::new(move || {
            if let Some(query) = upgrade(&weak) {
                query.dispatch(QueryAction::Continue);
            }
        }));
        config
    }

    fn on_fetch_success(&self, data: &Arc<Value>) {
        let data = self.set_data(Arc::clone(data), SetDataOptions::default());
        if let Some(cache) = self.cache() {
            let config = cache.config();
            if let Some(on_success) = &config.on_success {
                on_success(&data, self);
            }
            if let Some(on_settled) = &config.on_settled {
                let error = lock(&self.inner.state).error.clone();
                on_settled(Some(&data), error.as_ref(), self);
            }
        }
        self.schedule_gc();
    }

    fn on_fetch_error(&self, error: &QueryError) {
        let silent = error.as_cancelled().is_some_and(|cancelled| cancelled.silent);
        if !silent {
            self.dispatch(QueryAction::Error {
                error: error.clone(),
            });
        }
        if error.is_cancelled() {
            debug!(query_hash = %self.inner.query_hash, "query fetch cancelled");
        } else if let Some(cache) = self.cache() {
            debug!(query_hash = %self.inner.query_hash, %error, "query fetch failed");
            let config = cache.config();
            if let Some(on_error) = &config.on_error {
                on_error(error, self);
            }
            if let Some(on_settled) = &config.on_settled {
                let data = lock(&self.inner.state).data.clone();
                on_settled(data.as_ref(), Some(error), self);
            }
        }
        self.schedule_gc();
    }

    /// Applies `action` and notifies observers and cache listeners.
    pub(crate) fn dispatch(&self, action: QueryAction) {
        let revert = match &action {
            QueryAction::Error { error } if error.as_cancelled().is_some_and(|c| c.revert) => {
                lock(&self.inner.revert_state).clone()
            }
            _ => None,
        };
        let network_mode = lock(&self.inner.options).network_mode.unwrap_or_default();
        let fetch_status = if can_fetch(network_mode, &self.inner.env.online) {
            FetchStatus::Fetching
        } else {
            FetchStatus::Paused
        };
        {
            let mut state = lock(&self.inner.state);
            let next = reduce(&state, &action, revert, fetch_status);
            *state = next;
        }

        let observers = self.observers();
        let cache = self.cache();
        self.inner.env.notify.batch(|| {
            for observer in &observers {
                observer.on_query_update();
            }
            if let Some(cache) = cache {
                cache.notify(QueryCacheEvent::Updated {
                    query: self.clone(),
                    action,
                });
            }
        });
    }

    fn schedule_gc(&self) {
        self.clear_gc();
        let gc_time = self.gc_time();
        let weak = Arc::downgrade(&self.inner);
        let handle = timer::set_timeout(gc_time, move || {
            if let Some(query) = upgrade(&weak) {
                query.optional_remove();
            }
        });
        *lock(&self.inner.gc) = handle;
    }

    fn clear_gc(&self) {
        let handle = lock(&self.inner.gc).take();
        drop(handle);
    }

    /// Removes the query from its cache if nobody uses it and it is idle.
    pub(crate) fn optional_remove(&self) {
        let idle = lock(&self.inner.state).fetch_status == FetchStatus::Idle;
        if self.observer_count() == 0 && idle {
            if let Some(cache) = self.cache() {
                debug!(query_hash = %self.inner.query_hash, "garbage collecting query");
                cache.remove(self);
            }
        }
    }
}

fn upgrade(weak: &Weak<QueryInner>) -> Option<Query> {
    weak.upgrade().map(|inner| Query { inner })
}

/// The query state machine.
///
/// `fetching` is the status a new fetch enters: `Paused` when it cannot
/// reach the network.
fn reduce(
    state: &QueryState,
    action: &QueryAction,
    revert: Option<QueryState>,
    fetching: FetchStatus,
) -> QueryState {
    match action {
        QueryAction::Failed {
            failure_count,
            error,
        } => QueryState {
            fetch_failure_count: *failure_count,
            fetch_failure_reason: Some(error.clone()),
            ..state.clone()
        },
        QueryAction::Pause => QueryState {
            fetch_status: FetchStatus::Paused,
            ..state.clone()
        },
        QueryAction::Continue => QueryState {
            fetch_status: FetchStatus::Fetching,
            ..state.clone()
        },
        QueryAction::Fetch => {
            let mut next = QueryState {
                fetch_failure_count: 0,
                fetch_failure_reason: None,
                fetch_status: fetching,
                ..state.clone()
            };
            if state.data_updated_at == 0 {
                next.error = None;
                next.status = QueryStatus::Pending;
            }
            next
        }
        QueryAction::Success {
            data,
            data_updated_at,
            manual,
        } => {
            let mut next = QueryState {
                data: Some(Arc::clone(data)),
                data_update_count: state.data_update_count + 1,
                data_updated_at: data_updated_at.unwrap_or_else(now_millis),
                error: None,
                is_invalidated: false,
                status: QueryStatus::Success,
                ..state.clone()
            };
            if !manual {
                next.fetch_status = FetchStatus::Idle;
                next.fetch_failure_count = 0;
                next.fetch_failure_reason = None;
            }
            next
        }
        QueryAction::Error { error } => match revert {
            Some(revert) => QueryState {
                fetch_status: FetchStatus::Idle,
                ..revert
            },
            None => QueryState {
                error: Some(error.clone()),
                error_update_count: state.error_update_count + 1,
                error_updated_at: now_millis(),
                fetch_failure_count: state.fetch_failure_count + 1,
                fetch_failure_reason: Some(error.clone()),
                fetch_status: FetchStatus::Idle,
                status: QueryStatus::Error,
                ..state.clone()
            },
        },
        QueryAction::Invalidate => QueryState {
            is_invalidated: true,
            ..state.clone()
        },
        QueryAction::SetState { state } => (**state).clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CancelledError;
    use crate::query_key;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn fetching(state: &QueryState) -> QueryState {
        reduce(state, &QueryAction::Fetch, None, FetchStatus::Fetching)
    }

    #[test]
    fn test_initial_state_from_initial_data() {
        let options = QueryOptions::new("todos")
            .initial_data(json!([1]))
            .initial_data_updated_at(42);
        let state = QueryState::initial(&options);
        assert_eq!(state.status, QueryStatus::Success);
        assert_eq!(state.data_updated_at, 42);
        assert_eq!(state.data.as_deref(), Some(&json!([1])));
        assert_eq!(QueryState::initial(&QueryOptions::new("x")), QueryState::default());
    }

    #[test]
    fn test_reduce_fetch_without_data_clears_error() {
        let state = QueryState {
            error: Some(QueryError::fetch("old")),
            status: QueryStatus::Error,
            fetch_failure_count: 2,
            ..QueryState::default()
        };
        let next = fetching(&state);
        assert_eq!(next.status, QueryStatus::Pending);
        assert_eq!(next.error, None);
        assert_eq!(next.fetch_failure_count, 0);
        assert_eq!(next.fetch_status, FetchStatus::Fetching);

        let paused = reduce(&state, &QueryAction::Fetch, None, FetchStatus::Paused);
        assert_eq!(paused.fetch_status, FetchStatus::Paused);
    }

    #[test]
    fn test_reduce_fetch_with_data_keeps_status() {
        let state = QueryState {
            data: Some(Arc::new(json!(1))),
            data_updated_at: 10,
            status: QueryStatus::Success,
            ..QueryState::default()
        };
        let next = fetching(&state);
        assert_eq!(next.status, QueryStatus::Success);
        assert_eq!(next.data, state.data);
    }

    #[test]
    fn test_reduce_success_and_manual_success() {
        let state = fetching(&QueryState::default());
        let data = Arc::new(json!({"ok": true}));
        let next = reduce(
            &state,
            &QueryAction::Success {
                data: Arc::clone(&data),
                data_updated_at: Some(5),
                manual: false,
            },
            None,
            FetchStatus::Fetching,
        );
        assert_eq!(next.status, QueryStatus::Success);
        assert_eq!(next.fetch_status, FetchStatus::Idle);
        assert_eq!(next.data_update_count, 1);
        assert_eq!(next.data_updated_at, 5);

        let manual = reduce(
            &state,
            &QueryAction::Success {
                data,
                data_updated_at: None,
                manual: true,
            },
            None,
            FetchStatus::Fetching,
        );
        assert_eq!(manual.fetch_status, FetchStatus::Fetching);
        assert!(manual.data_updated_at > 0);
    }

    #[test]
    fn test_reduce_error_counts_failures() {
        let state = QueryState {
            fetch_failure_count: 2,
            ..fetching(&QueryState::default())
        };
        let error = QueryError::fetch("boom");
        let next = reduce(
            &state,
            &QueryAction::Error {
                error: error.clone(),
            },
            None,
            FetchStatus::Fetching,
        );
        assert_eq!(next.status, QueryStatus::Error);
        assert_eq!(next.fetch_status, FetchStatus::Idle);
        assert_eq!(next.fetch_failure_count, 3);
        assert_eq!(next.error_update_count, 1);
        assert_eq!(next.error, Some(error.clone()));
        assert_eq!(next.fetch_failure_reason, Some(error));
    }

    #[test]
    fn test_reduce_revert_restores_snapshot() {
        let snapshot = QueryState {
            data: Some(Arc::new(json!("before"))),
            status: QueryStatus::Success,
            data_updated_at: 1,
            fetch_status: FetchStatus::Fetching,
            ..QueryState::default()
        };
        let error: QueryError = CancelledError {
            revert: true,
            silent: false,
        }
        .into();
        let next = reduce(
            &QueryState::default(),
            &QueryAction::Error { error },
            Some(snapshot.clone()),
            FetchStatus::Fetching,
        );
        assert_eq!(next.data, snapshot.data);
        assert_eq!(next.fetch_status, FetchStatus::Idle);
    }

    #[test]
    fn test_reduce_failed_pause_continue_invalidate() {
        let state = fetching(&QueryState::default());
        let failed = reduce(
            &state,
            &QueryAction::Failed {
                failure_count: 1,
                error: QueryError::fetch("x"),
            },
            None,
            FetchStatus::Fetching,
        );
        assert_eq!(failed.fetch_failure_count, 1);
        let paused = reduce(&failed, &QueryAction::Pause, None, FetchStatus::Fetching);
        assert_eq!(paused.fetch_status, FetchStatus::Paused);
        let resumed = reduce(&paused, &QueryAction::Continue, None, FetchStatus::Fetching);
        assert_eq!(resumed.fetch_status, FetchStatus::Fetching);
        let invalid = reduce(&resumed, &QueryAction::Invalidate, None, FetchStatus::Fetching);
        assert!(invalid.is_invalidated);
    }

    #[test]
    fn test_state_serializes_camel_case() {
        let state = QueryState {
            status: QueryStatus::Success,
            data: Some(Arc::new(json!(1))),
            ..QueryState::default()
        };
        let json = serde_json::to_value(&state).expect("state should serialize");
        assert_eq!(json["status"], json!("success"));
        assert_eq!(json["fetchStatus"], json!("idle"));
        assert_eq!(json["dataUpdateCount"], json!(0));
    }

    #[test]
    fn test_signal_marks_consumption() {
        let context = QueryFunctionContext::new(query_key!["a"], None);
        assert!(!context.signal_consumed.load(Ordering::SeqCst));
        let _token = context.signal();
        assert!(context.signal_consumed.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_deduplicates_concurrent_calls() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let query = cache.build(
            QueryOptions::new("dedup").query_fn(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(json!("x"))
                }
            }),
            None,
        );

        let first = query.fetch(None, FetchOptions::default());
        let second = query.fetch(None, FetchOptions::default());
        let (a, b) = futures::join!(first, second);
        assert_eq!(a, b);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(query.state().status, QueryStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_without_query_fn_rejects() {
        let cache = QueryCache::new();
        let query = cache.build(QueryOptions::new("nofn"), None);
        let result = query.fetch(None, FetchOptions::default()).await;
        assert!(matches!(result, Err(QueryError::MissingQueryFn { .. })));
        assert_eq!(query.state().status, QueryStatus::Error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_data_shares_equal_values() {
        let cache = QueryCache::new();
        let query = cache.build(QueryOptions::new("shared"), None);
        let first = query.set_data(json!({"a": [1, 2]}), SetDataOptions::default());
        let second = query.set_data(json!({"a": [1, 2]}), SetDataOptions::default());
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(query.state().data_update_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_with_revert_restores_state() {
        let cache = QueryCache::new();
        let query = cache.build(
            QueryOptions::new("slow").query_fn(|_| async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok(json!("late"))
            }),
            None,
        );
        query.set_data(json!("seed"), SetDataOptions::default());
        let promise = query.fetch(None, FetchOptions::default());
        assert_eq!(query.state().fetch_status, FetchStatus::Fetching);

        query.cancel(CancelOptions::revert()).await;
        assert!(promise.await.is_err_and(|err| err.is_cancelled()));
        let state = query.state();
        assert_eq!(state.fetch_status, FetchStatus::Idle);
        assert_eq!(state.data.as_deref(), Some(&json!("seed")));
        assert_eq!(state.status, QueryStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_refetch_restarts_when_data_exists() {
        let cache = QueryCache::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let query = cache.build(
            QueryOptions::new("restart").query_fn(move |_| {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(json!(n))
                }
            }),
            None,
        );
        query.set_data(json!(0), SetDataOptions::default());
        let _first = query.fetch(None, FetchOptions::default());
        tokio::time::sleep(Duration::from_millis(1)).await;
        let second = query.fetch(
            None,
            FetchOptions {
                cancel_refetch: true,
            },
        );
        assert_eq!(second.await.map(|data| (*data).clone()), Ok(json!(2)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_fetch_pauses_then_resumes() {
        let cache = QueryCache::new();
        let env = cache.env().clone();
        env.online.set_online(false);
        let query = cache.build(
            QueryOptions::new("offline").query_fn(|_| async { Ok(json!(true)) }),
            None,
        );
        let promise = query.fetch(None, FetchOptions::default());
        assert_eq!(query.state().fetch_status, FetchStatus::Paused);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(query.state().fetch_status, FetchStatus::Paused);

        env.online.set_online(true);
        query.on_online();
        assert!(promise.await.is_ok());
        assert_eq!(query.state().fetch_status, FetchStatus::Idle);
        assert_eq!(query.state().status, QueryStatus::Success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_removes_unused_query() {
        let cache = QueryCache::new();
        let query = cache.build(
            QueryOptions::new("gc").gc_time(Duration::from_millis(100)),
            None,
        );
        assert!(cache.get(query.query_hash()).is_some());
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(cache.get(query.query_hash()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_gc_time_only_grows() {
        let cache = QueryCache::new();
        let query = cache.build(QueryOptions::new("grow").gc_time(Duration::from_secs(10)), None);
        query.set_options(QueryOptions::new("grow").gc_time(Duration::from_secs(1)));
        assert_eq!(query.gc_time(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_and_staleness() {
        let cache = QueryCache::new();
        let query = cache.build(QueryOptions::new("stale"), None);
        assert!(query.is_stale_by_time(Duration::MAX));
        query.set_data(json!(1), SetDataOptions::default());
        assert!(!query.is_stale_by_time(Duration::from_secs(60)));
        assert!(query.is_stale_by_time(Duration::ZERO));
        query.invalidate();
        assert!(query.is_stale_by_time(Duration::MAX));
        assert!(query.state().is_invalidated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_restores_initial_state() {
        let cache = QueryCache::new();
        let query = cache.build(QueryOptions::new("reset").initial_data(json!("init")), None);
        query.set_data(json!("changed"), SetDataOptions::default());
        query.reset();
        assert_eq!(query.state().data.as_deref(), Some(&json!("init")));
    }
}
