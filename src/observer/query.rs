use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::next_observer_id;
use crate::client::QueryClient;
use crate::config::{Placeholder, QueryObserverOptions, RefetchOn, SelectFn};
use crate::error::QueryError;
use crate::query::{FetchOptions, FetchStatus, Query, QueryState, QueryStatus};
use crate::query_cache::QueryCacheEvent;
use crate::retryer::{Promise, can_fetch};
use crate::subscription::{ListenerSet, ResultStream, Unsubscribe, stream_from};
use crate::timer::{self, TimeoutHandle};
use crate::utils::{lock, replace_data, time_until_stale};

/// What a [`QueryObserver`] exposes: the query state plus derived flags.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryObserverResult {
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
    /// The (selected) data, or placeholder data.
    pub data: Option<Arc<Value>>,
    pub data_updated_at: u64,
    pub error: Option<QueryError>,
    pub error_updated_at: u64,
    pub failure_count: u32,
    pub failure_reason: Option<QueryError>,
    pub error_update_count: u32,
    pub is_fetching: bool,
    pub is_stale: bool,
    pub is_pending: bool,
    /// First load: pending and fetching.
    pub is_loading: bool,
    pub is_success: bool,
    pub is_error: bool,
    pub is_paused: bool,
    pub is_fetched: bool,
    pub is_fetched_after_mount: bool,
    /// Fetching in the background while data or an error is shown.
    pub is_refetching: bool,
    pub is_loading_error: bool,
    pub is_refetch_error: bool,
    pub is_placeholder_data: bool,
}

impl QueryObserverResult {
    /// Decodes the data into `T`.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<Option<T>, QueryError> {
        self.data
            .as_deref()
            .map(|data| {
                serde_json::from_value(data.clone()).map_err(|e| QueryError::Decode(e.to_string()))
            })
            .transpose()
    }
}

struct ObserverState {
    options: QueryObserverOptions,
    current_query: Query,
    current_query_initial_state: QueryState,
    current_result: QueryObserverResult,
    current_result_state: Option<QueryState>,
    last_query_with_defined_data: Option<Query>,
    select: SelectMemo,
    refetch_interval: Option<Duration>,
    stale_timer: Option<TimeoutHandle>,
    interval_timer: Option<TimeoutHandle>,
}

#[derive(Clone, Default)]
struct SelectMemo {
    select_fn: Option<SelectFn>,
    result: Option<Arc<Value>>,
}

struct ObserverInner {
    id: u64,
    client: QueryClient,
    state: Mutex<ObserverState>,
    listeners: ListenerSet<QueryObserverResult>,
    delivery_pending: AtomicBool,
}

impl Drop for ObserverInner {
    fn drop(&mut self) {
        let query = lock(&self.state).current_query.clone();
        query.detach_observer(self.id);
    }
}

/// Watches one query and derives a [`QueryObserverResult`] from it.
///
/// The observer attaches to its query when the first listener subscribes
/// and detaches when the last one leaves.
#[derive(Clone)]
pub struct QueryObserver {
    inner: Arc<ObserverInner>,
}

#[derive(Clone)]
pub(crate) struct WeakQueryObserver {
    id: u64,
    inner: Weak<ObserverInner>,
}

impl WeakQueryObserver {
    pub(crate) const fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn upgrade(&self) -> Option<QueryObserver> {
        self.inner.upgrade().map(|inner| QueryObserver { inner })
    }
}

impl fmt::Debug for QueryObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("QueryObserver")
            .field("id", &self.inner.id)
            .field("query_hash", &state.current_query.query_hash())
            .field("listeners", &self.inner.listeners.len())
            .finish_non_exhaustive()
    }
}

impl QueryObserver {
    pub fn new(client: &QueryClient, options: QueryObserverOptions) -> Self {
        let options = client.default_query_options(options);
        let query = client.query_cache().build(options.query.clone(), None);
        query.set_options(options.query.clone());
        let initial_state = query.state();

        let observer = Self {
            inner: Arc::new(ObserverInner {
                id: next_observer_id(),
                client: client.clone(),
                state: Mutex::new(ObserverState {
                    options,
                    current_query: query,
                    current_query_initial_state: initial_state,
                    current_result: QueryObserverResult::default(),
                    current_result_state: None,
                    last_query_with_defined_data: None,
                    select: SelectMemo::default(),
                    refetch_interval: None,
                    stale_timer: None,
                    interval_timer: None,
                }),
                listeners: ListenerSet::new(),
                delivery_pending: AtomicBool::new(false),
            }),
        };
        observer.update_result();
        observer
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub(crate) fn downgrade(&self) -> WeakQueryObserver {
        WeakQueryObserver {
            id: self.inner.id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    #[must_use]
    pub fn options(&self) -> QueryObserverOptions {
        lock(&self.inner.state).options.clone()
    }

    #[must_use]
    pub fn get_current_result(&self) -> QueryObserverResult {
        lock(&self.inner.state).current_result.clone()
    }

    #[must_use]
    pub fn get_current_query(&self) -> Query {
        lock(&self.inner.state).current_query.clone()
    }

    #[must_use]
    pub fn has_listeners(&self) -> bool {
        !self.inner.listeners.is_empty()
    }

    fn query_and_options(&self) -> (Query, QueryObserverOptions) {
        let state = lock(&self.inner.state);
        (state.current_query.clone(), state.options.clone())
    }

    /// Registers `listener`. The first listener mounts the observer, which
    /// may start a fetch.
    pub fn subscribe(
        &self,
        listener: impl Fn(&QueryObserverResult) + Send + Sync + 'static,
    ) -> Unsubscribe {
        let id = self.inner.listeners.add(Arc::new(listener));
        if self.inner.listeners.len() == 1 {
            self.on_subscribe();
        }
        let weak = self.downgrade();
        Unsubscribe::new(move || {
            if let Some(observer) = weak.upgrade() {
                observer.inner.listeners.remove(id);
                if !observer.has_listeners() {
                    observer.destroy();
                }
            }
        })
    }

    /// Streams results, starting with the current one.
    pub fn stream(&self) -> ResultStream<QueryObserverResult> {
        stream_from(Some(self.get_current_result()), |tx| {
            self.subscribe(move |result| {
                let _ = tx.send(result.clone());
            })
        })
    }

    fn on_subscribe(&self) {
        let (query, options) = self.query_and_options();
        query.add_observer(self);
        if should_fetch_on_mount(&query, &options) {
            let _ = self.execute_fetch(FetchOptions::default());
        }
        self.update_result();
        self.update_timers();
    }

    /// Detaches from the query, stops the timers and drops all listeners.
    pub fn destroy(&self) {
        self.inner.listeners.clear();
        let query = {
            let mut state = lock(&self.inner.state);
            state.stale_timer = None;
            state.interval_timer = None;
            state.current_query.clone()
        };
        query.remove_observer(self);
    }

    /// Replaces the options, re-targeting the query when the key changes.
    pub fn set_options(&self, options: QueryObserverOptions) {
        let options = self.inner.client.default_query_options(options);
        let (prev_query, prev_options) = {
            let mut state = lock(&self.inner.state);
            let prev_options = std::mem::replace(&mut state.options, options.clone());
            (state.current_query.clone(), prev_options)
        };

        self.update_query();
        let query = self.get_current_query();
        query.set_options(options.query.clone());
        self.inner
            .client
            .query_cache()
            .notify(QueryCacheEvent::ObserverOptionsUpdated {
                query: query.clone(),
                observer: self.clone(),
            });

        let mounted = self.has_listeners();
        if mounted && should_fetch_optionally(&query, &prev_query, &options, &prev_options) {
            let _ = self.execute_fetch(FetchOptions::default());
        }
        self.update_result();

        let query_changed = !query.ptr_eq(&prev_query);
        let enabled_changed = options.is_enabled() != prev_options.is_enabled();
        if mounted && (query_changed || enabled_changed || options.stale_time != prev_options.stale_time) {
            self.update_stale_timeout();
        }
        let next_interval = self.compute_refetch_interval();
        let current_interval = lock(&self.inner.state).refetch_interval;
        if mounted && (query_changed || enabled_changed || next_interval != current_interval) {
            self.update_refetch_interval(next_interval);
        }
    }

    /// The result `options` would produce right now.
    ///
    /// Starts the fetch a mount (or an option change, when mounted) would
    /// start, so the reported `Fetching` status is backed by a running fetch.
    pub fn get_optimistic_result(&self, options: QueryObserverOptions) -> QueryObserverResult {
        let options = self.inner.client.default_query_options(options);
        let query = self
            .inner
            .client
            .query_cache()
            .build(options.query.clone(), None);
        if self.should_fetch_optimistically(&query, &options) {
            let _ = query.fetch(Some(options.query.clone()), FetchOptions::default());
        }
        let (result, _) = self.create_result(&query, &options, true);

        let mut state = lock(&self.inner.state);
        if state.current_result != result {
            state.current_result = result.clone();
            state.current_result_state = Some(query.state());
        }
        result
    }

    /// Fetches, cancelling a running fetch. Failures end up in the result.
    pub async fn refetch(&self) -> QueryObserverResult {
        self.fetch(FetchOptions {
            cancel_refetch: true,
        })
        .await
    }

    pub async fn fetch(&self, fetch_options: FetchOptions) -> QueryObserverResult {
        let promise = self.execute_fetch(fetch_options);
        let _ = promise.await;
        self.update_result();
        self.get_current_result()
    }

    pub(crate) fn refetch_in_background(&self) {
        let _ = self.execute_fetch(FetchOptions::default());
    }

    fn execute_fetch(&self, fetch_options: FetchOptions) -> Promise<Arc<Value>> {
        self.update_query();
        let (query, options) = self.query_and_options();
        query.fetch(Some(options.query), fetch_options)
    }

    #[must_use]
    pub fn should_fetch_on_window_focus(&self) -> bool {
        let (query, options) = self.query_and_options();
        should_fetch_on(&query, &options, options.refetch_on_window_focus)
    }

    #[must_use]
    pub fn should_fetch_on_reconnect(&self) -> bool {
        let (query, options) = self.query_and_options();
        should_fetch_on(&query, &options, options.refetch_on_reconnect)
    }

    pub(crate) fn current_result_is_stale(&self) -> bool {
        lock(&self.inner.state).current_result.is_stale
    }

    pub(crate) fn on_query_update(&self) {
        self.update_result();
        if self.has_listeners() {
            self.update_timers();
        }
    }

    fn update_query(&self) {
        let query_options = lock(&self.inner.state).options.query.clone();
        let query = self.inner.client.query_cache().build(query_options, None);
        let initial_state = query.state();
        let prev = {
            let mut state = lock(&self.inner.state);
            if state.current_query.ptr_eq(&query) {
                return;
            }
            state.current_query_initial_state = initial_state;
            std::mem::replace(&mut state.current_query, query.clone())
        };
        if self.has_listeners() {
            prev.remove_observer(self);
            query.add_observer(self);
        }
    }

    fn update_result(&self) {
        let (query, options) = self.query_and_options();
        let (next, select) = self.create_result(&query, &options, false);
        let query_state = query.state();
        let changed = {
            let mut state = lock(&self.inner.state);
            state.select = select;
            if query_state.data.is_some() {
                state.last_query_with_defined_data = Some(query.clone());
            }
            state.current_result_state = Some(query_state);
            if state.current_result == next {
                false
            } else {
                state.current_result = next;
                true
            }
        };
        if changed {
            self.notify(&query);
        }
    }

    fn notify(&self, query: &Query) {
        let notify = &self.inner.client.env().notify;
        notify.batch(|| {
            if !self.inner.delivery_pending.swap(true, Ordering::SeqCst) {
                let weak = self.downgrade();
                notify.schedule(move || {
                    if let Some(observer) = weak.upgrade() {
                        observer.deliver();
                    }
                });
            }
            self.inner
                .client
                .query_cache()
                .notify(QueryCacheEvent::ObserverResultsUpdated {
                    query: query.clone(),
                });
        });
    }

    fn deliver(&self) {
        self.inner.delivery_pending.store(false, Ordering::SeqCst);
        let result = self.get_current_result();
        self.inner.listeners.emit(&result);
    }

    fn should_fetch_optimistically(&self, query: &Query, options: &QueryObserverOptions) -> bool {
        let (prev_query, prev_options) = {
            let state = lock(&self.inner.state);
            (state.current_query.clone(), state.options.clone())
        };
        if self.has_listeners() {
            should_fetch_optionally(query, &prev_query, options, &prev_options)
        } else {
            should_fetch_on_mount(query, options)
        }
    }

    fn create_result(
        &self,
        query: &Query,
        options: &QueryObserverOptions,
        optimistic: bool,
    ) -> (QueryObserverResult, SelectMemo) {
        let (prev_query, prev_result, prev_result_state, initial_state, mut memo, last_defined) = {
            let state = lock(&self.inner.state);
            (
                state.current_query.clone(),
                state.current_result.clone(),
                state.current_result_state.clone(),
                state.current_query_initial_state.clone(),
                state.select.clone(),
                state.last_query_with_defined_data.clone(),
            )
        };
        let initial_state = if query.ptr_eq(&prev_query) {
            initial_state
        } else {
            query.state()
        };

        let mut next = query.state();
        if optimistic && self.should_fetch_optimistically(query, options) {
            let network_mode = options.query.network_mode.unwrap_or_default();
            next.fetch_failure_count = 0;
            next.fetch_failure_reason = None;
            next.fetch_status = if can_fetch(network_mode, &self.inner.client.env().online) {
                FetchStatus::Fetching
            } else {
                FetchStatus::Paused
            };
            if next.data.is_none() {
                next.error = None;
                next.status = QueryStatus::Pending;
            }
        }

        let sharing = options.query.structural_sharing.clone().unwrap_or_default();
        let mut status = next.status;
        let mut data = match (&options.select, &next.data) {
            (Some(select), Some(raw)) => {
                let same_input = prev_result_state
                    .as_ref()
                    .and_then(|state| state.data.as_ref())
                    .is_some_and(|prev| Arc::ptr_eq(prev, raw));
                let same_fn = memo
                    .select_fn
                    .as_ref()
                    .is_some_and(|prev| Arc::ptr_eq(prev, select));
                match &memo.result {
                    Some(selected) if same_input && same_fn => Some(Arc::clone(selected)),
                    _ => {
                        let selected = Arc::new(select(raw));
                        let selected = replace_data(prev_result.data.as_ref(), selected, &sharing);
                        memo.select_fn = Some(Arc::clone(select));
                        memo.result = Some(Arc::clone(&selected));
                        Some(selected)
                    }
                }
            }
            _ => next.data.clone(),
        };

        let mut is_placeholder_data = false;
        if data.is_none() && status == QueryStatus::Pending {
            let placeholder = match &options.placeholder_data {
                Some(Placeholder::Value(value)) => Some(Arc::clone(value)),
                Some(Placeholder::KeepPrevious) => last_defined.and_then(|q| q.state().data),
                None => None,
            };
            if let Some(placeholder) = placeholder {
                let placeholder = match &options.select {
                    Some(select) => Arc::new(select(&placeholder)),
                    None => placeholder,
                };
                status = QueryStatus::Success;
                data = Some(replace_data(prev_result.data.as_ref(), placeholder, &sharing));
                is_placeholder_data = true;
            }
        }

        let is_fetching = next.fetch_status == FetchStatus::Fetching;
        let is_pending = status == QueryStatus::Pending;
        let is_error = status == QueryStatus::Error;
        let has_data = data.is_some();
        let result = QueryObserverResult {
            status,
            fetch_status: next.fetch_status,
            data,
            data_updated_at: next.data_updated_at,
            error: next.error,
            error_updated_at: next.error_updated_at,
            failure_count: next.fetch_failure_count,
            failure_reason: next.fetch_failure_reason,
            error_update_count: next.error_update_count,
            is_fetching,
            is_stale: is_stale(query, options),
            is_pending,
            is_loading: is_pending && is_fetching,
            is_success: status == QueryStatus::Success,
            is_error,
            is_paused: next.fetch_status == FetchStatus::Paused,
            is_fetched: next.data_update_count > 0 || next.error_update_count > 0,
            is_fetched_after_mount: next.data_update_count > initial_state.data_update_count
                || next.error_update_count > initial_state.error_update_count,
            is_refetching: is_fetching && !is_pending,
            is_loading_error: is_error && !has_data,
            is_refetch_error: is_error && has_data,
            is_placeholder_data,
        };
        (result, memo)
    }

    fn update_timers(&self) {
        self.update_stale_timeout();
        self.update_refetch_interval(self.compute_refetch_interval());
    }

    /// Re-derives the result once the data turns stale. Never refetches.
    fn update_stale_timeout(&self) {
        let (is_stale, updated_at, stale_time) = {
            let state = lock(&self.inner.state);
            (
                state.current_result.is_stale,
                state.current_result.data_updated_at,
                state.options.stale_time_or_default(),
            )
        };
        let handle = if is_stale || stale_time == Duration::MAX {
            None
        } else {
            let timeout = time_until_stale(updated_at, stale_time) + Duration::from_millis(1);
            let weak = self.downgrade();
            timer::set_timeout(timeout, move || {
                if let Some(observer) = weak.upgrade() {
                    if !observer.current_result_is_stale() {
                        observer.update_result();
                    }
                }
            })
        };
        lock(&self.inner.state).stale_timer = handle;
    }

    fn compute_refetch_interval(&self) -> Option<Duration> {
        lock(&self.inner.state)
            .options
            .refetch_interval
            .filter(|interval| !interval.is_zero() && *interval != Duration::MAX)
    }

    fn update_refetch_interval(&self, interval: Option<Duration>) {
        let enabled = lock(&self.inner.state).options.is_enabled();
        let handle = match interval {
            Some(period) if enabled => {
                let weak = self.downgrade();
                let focus = self.inner.client.env().focus.clone();
                timer::set_interval(period, move || {
                    if let Some(observer) = weak.upgrade() {
                        let background = observer
                            .options()
                            .refetch_interval_in_background
                            .unwrap_or(false);
                        if background || focus.is_focused() {
                            observer.refetch_in_background();
                        }
                    }
                })
            }
            _ => None,
        };
        let mut state = lock(&self.inner.state);
        state.refetch_interval = interval;
        state.interval_timer = handle;
    }
}

fn is_stale(query: &Query, options: &QueryObserverOptions) -> bool {
    options.is_enabled() && query.is_stale_by_time(options.stale_time_or_default())
}

fn should_load_on_mount(query: &Query, options: &QueryObserverOptions) -> bool {
    let state = query.state();
    options.is_enabled()
        && state.data.is_none()
        && !(state.status == QueryStatus::Error && options.retry_on_mount == Some(false))
}

fn should_fetch_on_mount(query: &Query, options: &QueryObserverOptions) -> bool {
    should_load_on_mount(query, options)
        || (query.state().data.is_some()
            && should_fetch_on(query, options, options.refetch_on_mount))
}

fn should_fetch_on(query: &Query, options: &QueryObserverOptions, policy: Option<RefetchOn>) -> bool {
    if !options.is_enabled() {
        return false;
    }
    match policy.unwrap_or_default() {
        RefetchOn::Never => false,
        RefetchOn::Always => true,
        RefetchOn::IfStale => is_stale(query, options),
    }
}

fn should_fetch_optionally(
    query: &Query,
    prev_query: &Query,
    options: &QueryObserverOptions,
    prev_options: &QueryObserverOptions,
) -> bool {
    (!query.ptr_eq(prev_query) || !prev_options.is_enabled()) && is_stale(query, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::SetDataOptions;
    use crate::retryer::Retry;
    use serde_json::json;
    use std::sync::atomic::AtomicU32;

    fn recorder() -> (
        Arc<Mutex<Vec<QueryObserverResult>>>,
        impl Fn(&QueryObserverResult) + Send + Sync + 'static,
    ) {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&results);
        (results, move |result: &QueryObserverResult| {
            sink.lock().expect("lock").push(result.clone());
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_mount_fetches_and_reports_progress() {
        let client = QueryClient::new();
        let observer = QueryObserver::new(
            &client,
            QueryObserverOptions::new("todos").query_fn(|_| async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(json!(["a"]))
            }),
        );
        assert!(observer.get_current_result().is_pending);
        assert!(!observer.get_current_result().is_fetching);

        let (results, listener) = recorder();
        let unsubscribe = observer.subscribe(listener);
        assert!(observer.get_current_result().is_loading);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let current = observer.get_current_result();
        assert!(current.is_success);
        assert_eq!(current.data.as_deref(), Some(&json!(["a"])));
        assert!(current.is_fetched_after_mount);

        let seen = results.lock().expect("lock").clone();
        assert!(seen.first().is_some_and(|r| r.is_loading));
        assert!(seen.last().is_some_and(|r| r.is_success));
        unsubscribe.unsubscribe();
        assert_eq!(observer.get_current_query().observer_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_observer_does_not_fetch() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let observer = QueryObserver::new(
            &client,
            QueryObserverOptions::new("off")
                .enabled(false)
                .query_fn(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok(json!(1)) }
                }),
        );
        let _subscription = observer.subscribe(|_| {});
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!observer.get_current_query().is_active());

        let result = observer.refetch().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(result.is_success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_data_is_not_refetched_on_mount() {
        let client = QueryClient::new();
        client.set_query_data("fresh", |_| Some(json!(1)));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let observer = QueryObserver::new(
            &client,
            QueryObserverOptions::new("fresh")
                .stale_time(Duration::from_secs(60))
                .query_fn(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Ok(json!(2)) }
                }),
        );
        let _subscription = observer.subscribe(|_| {});
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!observer.get_current_result().is_stale);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_reemits_without_fetching() {
        let client = QueryClient::new();
        client.set_query_data("timer", |_| Some(json!(1)));
        let observer = QueryObserver::new(
            &client,
            QueryObserverOptions::new("timer")
                .stale_time(Duration::from_millis(100))
                .query_fn(|_| async { Ok(json!(2)) }),
        );
        let (results, listener) = recorder();
        let _subscription = observer.subscribe(listener);
        assert!(!observer.get_current_result().is_stale);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(observer.get_current_result().is_stale);
        assert!(results.lock().expect("lock").iter().any(|r| r.is_stale));
        assert_eq!(observer.get_current_result().data.as_deref(), Some(&json!(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_select_shares_structure() {
        let client = QueryClient::new();
        let observer = QueryObserver::new(
            &client,
            QueryObserverOptions::new("select")
                .select(|data| json!({"count": data["items"].as_array().map_or(0, Vec::len)}))
                .query_fn(|_| async { Ok(json!({"items": [1, 2, 3]})) }),
        );
        let _subscription = observer.subscribe(|_| {});
        tokio::time::sleep(Duration::from_millis(1)).await;
        let first = observer.get_current_result();
        assert_eq!(first.data.as_deref(), Some(&json!({"count": 3})));

        client.set_query_data("select", |_| Some(json!({"items": [4, 5, 6]})));
        let second = observer.get_current_result();
        let (a, b) = (first.data.expect("data"), second.data.expect("data"));
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test(start_paused = true)]
    async fn test_placeholder_data() {
        let client = QueryClient::new();
        let observer = QueryObserver::new(
            &client,
            QueryObserverOptions::new("placeholder")
                .placeholder_data(Placeholder::Value(Arc::new(json!("soon"))))
                .query_fn(|_| async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(json!("real"))
                }),
        );
        let _subscription = observer.subscribe(|_| {});
        let result = observer.get_current_result();
        assert!(result.is_placeholder_data);
        assert!(result.is_success);
        assert_eq!(result.data.as_deref(), Some(&json!("soon")));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let result = observer.get_current_result();
        assert!(!result.is_placeholder_data);
        assert_eq!(result.data.as_deref(), Some(&json!("real")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_previous_data_across_keys() {
        let client = QueryClient::new();
        let options = |page: i64| {
            QueryObserverOptions::new(crate::query_key!["page", page])
                .placeholder_data(Placeholder::KeepPrevious)
                .query_fn(move |_| async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Ok(json!(page))
                })
        };
        let observer = QueryObserver::new(&client, options(1));
        let _subscription = observer.subscribe(|_| {});
        tokio::time::sleep(Duration::from_millis(20)).await;

        observer.set_options(options(2));
        let result = observer.get_current_result();
        assert!(result.is_placeholder_data);
        assert_eq!(result.data.as_deref(), Some(&json!(1)));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(observer.get_current_result().data.as_deref(), Some(&json!(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_optimistic_result_starts_fetch() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let observer = QueryObserver::new(&client, QueryObserverOptions::new("optimistic"));
        let options = QueryObserverOptions::new("optimistic").query_fn(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(json!(1)) }
        });
        let result = observer.get_optimistic_result(options.clone());
        assert!(result.is_loading);
        assert_eq!(result.fetch_status, FetchStatus::Fetching);
        let query = client.query_cache().get(r#"["optimistic"]"#).expect("query built");
        assert_eq!(query.state().fetch_status, FetchStatus::Fetching);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(query.state().data.as_deref(), Some(&json!(1)));

        // fresh data is not refetched
        let again = observer.get_optimistic_result(options.stale_time(Duration::MAX));
        assert_eq!(again.fetch_status, FetchStatus::Idle);
        assert!(again.is_success);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_before_gc_keeps_query() {
        let client = QueryClient::new();
        let observer = QueryObserver::new(
            &client,
            QueryObserverOptions::new("gc-cycle")
                .query_fn(|_| async { Ok(json!("kept")) })
                .gc_time(Duration::from_millis(100))
                .stale_time(Duration::MAX),
        );
        let hash = r#"["gc-cycle"]"#;
        let first = observer.subscribe(|_| {});
        tokio::time::sleep(Duration::from_millis(1)).await;
        let query = client.query_cache().get(hash).expect("query cached");
        first.unsubscribe();
        assert_eq!(query.observer_count(), 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = observer.subscribe(|_| {});
        tokio::time::sleep(Duration::from_millis(100)).await;
        let survivor = client.query_cache().get(hash).expect("query survives the first deadline");
        assert!(survivor.ptr_eq(&query));
        assert_eq!(survivor.state().data.as_deref(), Some(&json!("kept")));

        second.unsubscribe();
        tokio::time::sleep(Duration::from_millis(90)).await;
        assert!(client.query_cache().get(hash).is_some());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(client.query_cache().get(hash).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_refetch_interval() {
        let client = QueryClient::new();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let observer = QueryObserver::new(
            &client,
            QueryObserverOptions::new("poll")
                .refetch_interval(Duration::from_millis(100))
                .query_fn(move |_| {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(json!(n)) }
                }),
        );
        let unsubscribe = observer.subscribe(|_| {});
        tokio::time::sleep(Duration::from_millis(350)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        unsubscribe.unsubscribe();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_updates_in_one_batch_notify_once() {
        let client = QueryClient::new();
        client.set_query_data("batched", |_| Some(json!(0)));
        let observer = QueryObserver::new(
            &client,
            QueryObserverOptions::new("batched").stale_time(Duration::MAX),
        );
        let (results, listener) = recorder();
        let _subscription = observer.subscribe(listener);
        results.lock().expect("lock").clear();

        let query = observer.get_current_query();
        client.env().notify.batch(|| {
            for n in 1..=5 {
                query.set_data(json!(n), SetDataOptions::default());
            }
        });
        let seen = results.lock().expect("lock").clone();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].data.as_deref(), Some(&json!(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_surface_in_result() {
        let client = QueryClient::new();
        let observer = QueryObserver::new(
            &client,
            QueryObserverOptions::new("failing")
                .retry(Retry::Never)
                .query_fn(|_| async { Err(QueryError::fetch("down")) }),
        );
        let result = observer.refetch().await;
        assert!(result.is_error);
        assert!(result.is_loading_error);
        assert_eq!(result.error, Some(QueryError::fetch("down")));
        assert_eq!(result.data_as::<i64>(), Ok(None));
    }
}
