//! Options for queries, observers and mutations, and the client-wide
//! defaults they fall back to.
//!
//! Every optional field left as `None` is filled in by
//! [`crate::QueryClient::default_query_options`] (or the mutation
//! counterpart): first from per-key defaults, then from [`QueryConfig`].

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::error::QueryError;
use crate::key::{MutationKey, QueryKey};
use crate::query::QueryFunctionContext;
use crate::retryer::{NetworkMode, Retry, RetryDelay};

/// Default time an unused query stays cached.
pub const DEFAULT_GC_TIME: Duration = Duration::from_secs(5 * 60);

/// Fetches the data for a query.
pub type QueryFn = Arc<
    dyn Fn(QueryFunctionContext) -> BoxFuture<'static, Result<Value, QueryError>> + Send + Sync,
>;

/// Performs a mutation for the given variables.
pub type MutationFn =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, QueryError>> + Send + Sync>;

/// Projects query data into the shape an observer exposes.
pub type SelectFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;

/// Custom structural sharing: receives the previous and next data.
pub type ShareFn = Arc<dyn Fn(Option<&Arc<Value>>, Arc<Value>) -> Arc<Value> + Send + Sync>;

/// `on_mutate(variables)`; the returned value becomes the mutation context.
pub type OnMutateFn = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;
/// `on_success(data, variables, context)`.
pub type OnMutationSuccessFn = Arc<dyn Fn(&Value, &Value, Option<&Value>) + Send + Sync>;
/// `on_error(error, variables, context)`.
pub type OnMutationErrorFn = Arc<dyn Fn(&QueryError, &Value, Option<&Value>) + Send + Sync>;
/// `on_settled(data, error, variables, context)`.
pub type OnMutationSettledFn =
    Arc<dyn Fn(Option<&Value>, Option<&QueryError>, &Value, Option<&Value>) + Send + Sync>;

/// Wraps an async closure into a [`QueryFn`].
pub fn query_fn<F, Fut>(f: F) -> QueryFn
where
    F: Fn(QueryFunctionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, QueryError>> + Send + 'static,
{
    Arc::new(move |context| f(context).boxed())
}

/// Wraps an async closure into a [`MutationFn`].
pub fn mutation_fn<F, Fut>(f: F) -> MutationFn
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, QueryError>> + Send + 'static,
{
    Arc::new(move |variables| f(variables).boxed())
}

/// How new data is reconciled with the data already cached.
#[derive(Clone, Default)]
pub enum StructuralSharing {
    /// Keep the previous value when the new one is deeply equal.
    #[default]
    Enabled,
    /// Always take the new value.
    Disabled,
    Custom(ShareFn),
}

impl fmt::Debug for StructuralSharing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Enabled => f.write_str("Enabled"),
            Self::Disabled => f.write_str("Disabled"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

/// Refetch policy for mount, window focus and reconnect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RefetchOn {
    Never,
    /// Refetch only if the data is stale.
    #[default]
    IfStale,
    Always,
}

/// Data shown while a query has none of its own.
#[derive(Debug, Clone)]
pub enum Placeholder {
    Value(Arc<Value>),
    /// Keep showing the data of the previously observed query.
    KeepPrevious,
}

/// Client-wide defaults.
#[derive(Debug, Clone)]
pub struct QueryConfig {
    /// How long data is considered fresh. `Duration::MAX` means never stale.
    pub stale_time: Duration,

    /// How long an unused query stays cached. `Duration::MAX` means forever.
    pub gc_time: Duration,

    pub retry: Retry,
    pub retry_delay: RetryDelay,
    pub network_mode: NetworkMode,
    pub refetch_on_mount: RefetchOn,
    pub refetch_on_window_focus: RefetchOn,
    pub refetch_on_reconnect: RefetchOn,
    pub structural_sharing: StructuralSharing,

    pub mutation_retry: Retry,
    pub mutation_retry_delay: RetryDelay,
    pub mutation_network_mode: NetworkMode,
    /// Mutations are kept until removed unless this is finite.
    pub mutation_gc_time: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            stale_time: Duration::ZERO,
            gc_time: DEFAULT_GC_TIME,
            retry: Retry::Count(3),
            retry_delay: RetryDelay::default(),
            network_mode: NetworkMode::Online,
            refetch_on_mount: RefetchOn::IfStale,
            refetch_on_window_focus: RefetchOn::IfStale,
            refetch_on_reconnect: RefetchOn::IfStale,
            structural_sharing: StructuralSharing::Enabled,
            mutation_retry: Retry::Never,
            mutation_retry_delay: RetryDelay::default(),
            mutation_network_mode: NetworkMode::Online,
            mutation_gc_time: Duration::MAX,
        }
    }
}

impl QueryConfig {
    /// Defaults with the given stale and gc times.
    #[must_use]
    pub fn new(stale_time: Duration, gc_time: Duration) -> Self {
        Self {
            stale_time,
            gc_time,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_retry(mut self, retry: Retry) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_retry_delay(mut self, retry_delay: RetryDelay) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    #[must_use]
    pub const fn with_network_mode(mut self, network_mode: NetworkMode) -> Self {
        self.network_mode = network_mode;
        self
    }

    #[must_use]
    pub fn with_mutation_retry(mut self, retry: Retry) -> Self {
        self.mutation_retry = retry;
        self
    }
}

/// Options that identify and configure a query.
#[derive(Clone, Default)]
pub struct QueryOptions {
    pub query_key: QueryKey,
    /// Overrides the hash derived from `query_key`.
    pub query_hash: Option<String>,
    pub query_fn: Option<QueryFn>,
    pub retry: Option<Retry>,
    pub retry_delay: Option<RetryDelay>,
    pub network_mode: Option<NetworkMode>,
    pub gc_time: Option<Duration>,
    pub structural_sharing: Option<StructuralSharing>,
    /// Seeds a newly created query as successful.
    pub initial_data: Option<Value>,
    pub initial_data_updated_at: Option<u64>,
    pub meta: Option<Value>,
}

impl fmt::Debug for QueryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryOptions")
            .field("query_key", &self.query_key)
            .field("query_hash", &self.query_hash)
            .field("query_fn", &self.query_fn.as_ref().map(|_| ".."))
            .field("retry", &self.retry)
            .field("retry_delay", &self.retry_delay)
            .field("network_mode", &self.network_mode)
            .field("gc_time", &self.gc_time)
            .field("structural_sharing", &self.structural_sharing)
            .field("initial_data", &self.initial_data)
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

impl QueryOptions {
    pub fn new(query_key: impl Into<QueryKey>) -> Self {
        Self {
            query_key: query_key.into(),
            ..Self::default()
        }
    }

    /// The identity of the query these options address.
    #[must_use]
    pub fn hash(&self) -> String {
        self.query_hash
            .clone()
            .unwrap_or_else(|| self.query_key.hash())
    }

    #[must_use]
    pub fn query_fn<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(QueryFunctionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, QueryError>> + Send + 'static,
    {
        self.query_fn = Some(query_fn(f));
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: Retry) -> Self {
        self.retry = Some(retry);
        self
    }

    #[must_use]
    pub fn retry_delay(mut self, retry_delay: RetryDelay) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    #[must_use]
    pub const fn network_mode(mut self, network_mode: NetworkMode) -> Self {
        self.network_mode = Some(network_mode);
        self
    }

    #[must_use]
    pub const fn gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = Some(gc_time);
        self
    }

    #[must_use]
    pub fn structural_sharing(mut self, sharing: StructuralSharing) -> Self {
        self.structural_sharing = Some(sharing);
        self
    }

    #[must_use]
    pub fn initial_data(mut self, data: Value) -> Self {
        self.initial_data = Some(data);
        self
    }

    #[must_use]
    pub const fn initial_data_updated_at(mut self, updated_at: u64) -> Self {
        self.initial_data_updated_at = Some(updated_at);
        self
    }

    #[must_use]
    pub fn meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Fills every unset field from `defaults`.
    pub fn merge_from(&mut self, defaults: &Self) {
        fill(&mut self.query_fn, &defaults.query_fn);
        fill(&mut self.retry, &defaults.retry);
        fill(&mut self.retry_delay, &defaults.retry_delay);
        fill(&mut self.network_mode, &defaults.network_mode);
        fill(&mut self.gc_time, &defaults.gc_time);
        fill(&mut self.structural_sharing, &defaults.structural_sharing);
        fill(&mut self.meta, &defaults.meta);
    }

    /// Fills every unset field from the client-wide configuration.
    pub fn merge_config(&mut self, config: &QueryConfig) {
        self.retry.get_or_insert_with(|| config.retry.clone());
        self.retry_delay
            .get_or_insert_with(|| config.retry_delay.clone());
        self.network_mode.get_or_insert(config.network_mode);
        self.gc_time.get_or_insert(config.gc_time);
        self.structural_sharing
            .get_or_insert_with(|| config.structural_sharing.clone());
    }
}

/// Options of a [`crate::QueryObserver`].
#[derive(Clone, Default)]
pub struct QueryObserverOptions {
    pub query: QueryOptions,
    /// Disabled observers never fetch on their own. Defaults to `true`.
    pub enabled: Option<bool>,
    pub stale_time: Option<Duration>,
    pub refetch_on_mount: Option<RefetchOn>,
    pub refetch_on_window_focus: Option<RefetchOn>,
    pub refetch_on_reconnect: Option<RefetchOn>,
    pub refetch_interval: Option<Duration>,
    pub refetch_interval_in_background: Option<bool>,
    /// Whether a query that errored may retry when a new observer mounts.
    /// Defaults to `true`.
    pub retry_on_mount: Option<bool>,
    pub select: Option<SelectFn>,
    pub placeholder_data: Option<Placeholder>,
}

impl fmt::Debug for QueryObserverOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryObserverOptions")
            .field("query", &self.query)
            .field("enabled", &self.enabled)
            .field("stale_time", &self.stale_time)
            .field("refetch_on_mount", &self.refetch_on_mount)
            .field("refetch_on_window_focus", &self.refetch_on_window_focus)
            .field("refetch_on_reconnect", &self.refetch_on_reconnect)
            .field("refetch_interval", &self.refetch_interval)
            .field("retry_on_mount", &self.retry_on_mount)
            .field("select", &self.select.as_ref().map(|_| ".."))
            .field("placeholder_data", &self.placeholder_data)
            .finish_non_exhaustive()
    }
}

impl From<QueryOptions> for QueryObserverOptions {
    fn from(query: QueryOptions) -> Self {
        Self {
            query,
            ..Self::default()
        }
    }
}

impl QueryObserverOptions {
    pub fn new(query_key: impl Into<QueryKey>) -> Self {
        QueryOptions::new(query_key).into()
    }

    #[must_use]
    pub fn query_fn<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(QueryFunctionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, QueryError>> + Send + 'static,
    {
        self.query.query_fn = Some(query_fn(f));
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: Retry) -> Self {
        self.query.retry = Some(retry);
        self
    }

    #[must_use]
    pub fn retry_delay(mut self, retry_delay: RetryDelay) -> Self {
        self.query.retry_delay = Some(retry_delay);
        self
    }

    #[must_use]
    pub const fn network_mode(mut self, network_mode: NetworkMode) -> Self {
        self.query.network_mode = Some(network_mode);
        self
    }

    #[must_use]
    pub const fn gc_time(mut self, gc_time: Duration) -> Self {
        self.query.gc_time = Some(gc_time);
        self
    }

    #[must_use]
    pub fn initial_data(mut self, data: Value) -> Self {
        self.query.initial_data = Some(data);
        self
    }

    #[must_use]
    pub const fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    #[must_use]
    pub const fn stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    #[must_use]
    pub const fn refetch_on_mount(mut self, policy: RefetchOn) -> Self {
        self.refetch_on_mount = Some(policy);
        self
    }

    #[must_use]
    pub const fn refetch_on_window_focus(mut self, policy: RefetchOn) -> Self {
        self.refetch_on_window_focus = Some(policy);
        self
    }

    #[must_use]
    pub const fn refetch_on_reconnect(mut self, policy: RefetchOn) -> Self {
        self.refetch_on_reconnect = Some(policy);
        self
    }

    #[must_use]
    pub const fn refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }

    #[must_use]
    pub const fn refetch_interval_in_background(mut self, enabled: bool) -> Self {
        self.refetch_interval_in_background = Some(enabled);
        self
    }

    #[must_use]
    pub const fn retry_on_mount(mut self, enabled: bool) -> Self {
        self.retry_on_mount = Some(enabled);
        self
    }

    #[must_use]
    pub fn select(mut self, f: impl Fn(&Value) -> Value + Send + Sync + 'static) -> Self {
        self.select = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn placeholder_data(mut self, placeholder: Placeholder) -> Self {
        self.placeholder_data = Some(placeholder);
        self
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    #[must_use]
    pub fn stale_time_or_default(&self) -> Duration {
        self.stale_time.unwrap_or(Duration::ZERO)
    }

    /// Fills every unset field from `defaults`.
    pub fn merge_from(&mut self, defaults: &Self) {
        self.query.merge_from(&defaults.query);
        fill(&mut self.enabled, &defaults.enabled);
        fill(&mut self.stale_time, &defaults.stale_time);
        fill(&mut self.refetch_on_mount, &defaults.refetch_on_mount);
        fill(
            &mut self.refetch_on_window_focus,
            &defaults.refetch_on_window_focus,
        );
        fill(&mut self.refetch_on_reconnect, &defaults.refetch_on_reconnect);
        fill(&mut self.refetch_interval, &defaults.refetch_interval);
        fill(
            &mut self.refetch_interval_in_background,
            &defaults.refetch_interval_in_background,
        );
        fill(&mut self.retry_on_mount, &defaults.retry_on_mount);
        fill(&mut self.select, &defaults.select);
        fill(&mut self.placeholder_data, &defaults.placeholder_data);
    }

    /// Fills every unset field from the client-wide configuration.
    pub fn merge_config(&mut self, config: &QueryConfig) {
        self.query.merge_config(config);
        self.stale_time.get_or_insert(config.stale_time);
        self.refetch_on_mount.get_or_insert(config.refetch_on_mount);
        self.refetch_on_window_focus
            .get_or_insert(config.refetch_on_window_focus);
        self.refetch_on_reconnect
            .get_or_insert(config.refetch_on_reconnect);
    }
}

/// Options of a mutation.
#[derive(Clone, Default)]
pub struct MutationOptions {
    /// Used for filtering only. Mutations are never deduplicated.
    pub mutation_key: Option<MutationKey>,
    pub mutation_fn: Option<MutationFn>,
    pub retry: Option<Retry>,
    pub retry_delay: Option<RetryDelay>,
    pub network_mode: Option<NetworkMode>,
    pub gc_time: Option<Duration>,
    pub on_mutate: Option<OnMutateFn>,
    pub on_success: Option<OnMutationSuccessFn>,
    pub on_error: Option<OnMutationErrorFn>,
    pub on_settled: Option<OnMutationSettledFn>,
    pub meta: Option<Value>,
}

impl fmt::Debug for MutationOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationOptions")
            .field("mutation_key", &self.mutation_key)
            .field("mutation_fn", &self.mutation_fn.as_ref().map(|_| ".."))
            .field("retry", &self.retry)
            .field("retry_delay", &self.retry_delay)
            .field("network_mode", &self.network_mode)
            .field("gc_time", &self.gc_time)
            .field("meta", &self.meta)
            .finish_non_exhaustive()
    }
}

impl MutationOptions {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn mutation_key(mut self, key: impl Into<MutationKey>) -> Self {
        self.mutation_key = Some(key.into());
        self
    }

    #[must_use]
    pub fn mutation_fn<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, QueryError>> + Send + 'static,
    {
        self.mutation_fn = Some(mutation_fn(f));
        self
    }

    #[must_use]
    pub fn retry(mut self, retry: Retry) -> Self {
        self.retry = Some(retry);
        self
    }

    #[must_use]
    pub fn retry_delay(mut self, retry_delay: RetryDelay) -> Self {
        self.retry_delay = Some(retry_delay);
        self
    }

    #[must_use]
    pub const fn network_mode(mut self, network_mode: NetworkMode) -> Self {
        self.network_mode = Some(network_mode);
        self
    }

    #[must_use]
    pub const fn gc_time(mut self, gc_time: Duration) -> Self {
        self.gc_time = Some(gc_time);
        self
    }

    #[must_use]
    pub fn on_mutate(mut self, f: impl Fn(&Value) -> Option<Value> + Send + Sync + 'static) -> Self {
        self.on_mutate = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_success(
        mut self,
        f: impl Fn(&Value, &Value, Option<&Value>) + Send + Sync + 'static,
    ) -> Self {
        self.on_success = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_error(
        mut self,
        f: impl Fn(&QueryError, &Value, Option<&Value>) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_settled(
        mut self,
        f: impl Fn(Option<&Value>, Option<&QueryError>, &Value, Option<&Value>)
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.on_settled = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn meta(mut self, meta: Value) -> Self {
        self.meta = Some(meta);
        self
    }

    /// Fills every unset field from `defaults`.
    pub fn merge_from(&mut self, defaults: &Self) {
        fill(&mut self.mutation_fn, &defaults.mutation_fn);
        fill(&mut self.retry, &defaults.retry);
        fill(&mut self.retry_delay, &defaults.retry_delay);
        fill(&mut self.network_mode, &defaults.network_mode);
        fill(&mut self.gc_time, &defaults.gc_time);
        fill(&mut self.on_mutate, &defaults.on_mutate);
        fill(&mut self.on_success, &defaults.on_success);
        fill(&mut self.on_error, &defaults.on_error);
        fill(&mut self.on_settled, &defaults.on_settled);
        fill(&mut self.meta, &defaults.meta);
    }

    /// Fills every unset field from the client-wide configuration.
    pub fn merge_config(&mut self, config: &QueryConfig) {
        self.retry
            .get_or_insert_with(|| config.mutation_retry.clone());
        self.retry_delay
            .get_or_insert_with(|| config.mutation_retry_delay.clone());
        self.network_mode.get_or_insert(config.mutation_network_mode);
        self.gc_time.get_or_insert(config.mutation_gc_time);
    }
}

fn fill<T: Clone>(target: &mut Option<T>, source: &Option<T>) {
    if target.is_none() {
        target.clone_from(source);
    }
}
