//! The mutation entity.
//!
//! Every call to `mutate` creates a fresh [`Mutation`]. Its lifecycle hooks
//! run in a fixed order: the cache's `on_mutate`, the options' `on_mutate`
//! (whose return value becomes the context), the operation, then the
//! success or error chain (cache hook first, then the options' hook), and
//! finally the state update.

use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{self, BoxFuture};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::config::MutationOptions;
use crate::environment::Environment;
use crate::error::QueryError;
use crate::key::MutationKey;
use crate::mutation_cache::{MutationCache, MutationCacheEvent, WeakMutationCache};
use crate::observer::{MutationObserver, WeakMutationObserver};
use crate::retryer::{Operation, Promise, Retry, Retryer, RetryerConfig, can_fetch};
use crate::timer::{self, TimeoutHandle};
use crate::utils::{lock, now_millis};

/// Lifecycle status of a mutation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MutationStatus {
    #[default]
    Idle,
    Pending,
    Success,
    Error,
}

/// Snapshot of a mutation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationState {
    /// Whatever `on_mutate` returned.
    pub context: Option<Value>,
    pub data: Option<Value>,
    pub error: Option<QueryError>,
    pub failure_count: u32,
    pub failure_reason: Option<QueryError>,
    pub is_paused: bool,
    pub status: MutationStatus,
    pub variables: Option<Value>,
    /// Milliseconds since the Unix epoch, `0` if never submitted.
    pub submitted_at: u64,
}

/// State transitions of a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationAction {
    Pending {
        variables: Value,
        context: Option<Value>,
        is_paused: bool,
    },
    Failed {
        failure_count: u32,
        error: QueryError,
    },
    Pause,
    Continue,
    Success {
        data: Value,
    },
    Error {
        error: QueryError,
    },
    SetState {
        state: Box<MutationState>,
    },
}

struct MutationInner {
    mutation_id: u64,
    cache: WeakMutationCache,
    env: Environment,
    options: Mutex<MutationOptions>,
    state: Mutex<MutationState>,
    observers: Mutex<Vec<WeakMutationObserver>>,
    retryer: Mutex<Option<Retryer<Value>>>,
    execution: Mutex<Option<Promise<Value>>>,
    gc: Mutex<Option<TimeoutHandle>>,
}

/// Handle to a cached mutation. Clones refer to the same entity.
#[derive(Clone)]
pub struct Mutation {
    inner: Arc<MutationInner>,
}

impl fmt::Debug for Mutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutation")
            .field("mutation_id", &self.inner.mutation_id)
            .field("state", &*lock(&self.inner.state))
            .finish_non_exhaustive()
    }
}

impl PartialEq for Mutation {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Mutation {}

impl Mutation {
    pub(crate) fn new(
        cache: WeakMutationCache,
        env: Environment,
        mutation_id: u64,
        options: MutationOptions,
        state: Option<MutationState>,
    ) -> Self {
        let mutation = Self {
            inner: Arc::new(MutationInner {
                mutation_id,
                cache,
                env,
                options: Mutex::new(options),
                state: Mutex::new(state.unwrap_or_default()),
                observers: Mutex::new(Vec::new()),
                retryer: Mutex::new(None),
                execution: Mutex::new(None),
                gc: Mutex::new(None),
            }),
        };
        mutation.schedule_gc();
        mutation
    }

    /// Cache-scoped, monotonically increasing id.
    #[must_use]
    pub fn mutation_id(&self) -> u64 {
        self.inner.mutation_id
    }

    #[must_use]
    pub fn mutation_key(&self) -> Option<MutationKey> {
        lock(&self.inner.options).mutation_key.clone()
    }

    #[must_use]
    pub fn state(&self) -> MutationState {
        lock(&self.inner.state).clone()
    }

    #[must_use]
    pub fn options(&self) -> MutationOptions {
        lock(&self.inner.options).clone()
    }

    #[must_use]
    pub fn meta(&self) -> Option<Value> {
        lock(&self.inner.options).meta.clone()
    }

    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn set_options(&self, options: MutationOptions) {
        *lock(&self.inner.options) = options;
    }

    pub fn set_state(&self, state: MutationState) {
        self.dispatch(MutationAction::SetState {
            state: Box::new(state),
        });
    }

    pub(crate) fn cache(&self) -> Option<MutationCache> {
        self.inner.cache.upgrade()
    }

    #[must_use]
    pub fn observer_count(&self) -> usize {
        lock(&self.inner.observers).len()
    }

    fn observers(&self) -> Vec<MutationObserver> {
        lock(&self.inner.observers)
            .iter()
            .filter_map(WeakMutationObserver::upgrade)
            .collect()
    }

    pub(crate) fn add_observer(&self, observer: &MutationObserver) {
        {
            let mut observers = lock(&self.inner.observers);
            if observers.iter().any(|weak| weak.id() == observer.id()) {
                return;
            }
            observers.push(observer.downgrade());
        }
        self.clear_gc();
        if let Some(cache) = self.cache() {
            cache.notify(MutationCacheEvent::ObserverAdded {
                mutation: self.clone(),
                observer: observer.clone(),
            });
        }
    }

    pub(crate) fn remove_observer(&self, observer: &MutationObserver) {
        if self.detach_observer(observer.id()) {
            if let Some(cache) = self.cache() {
                cache.notify(MutationCacheEvent::ObserverRemoved {
                    mutation: self.clone(),
                    observer: observer.clone(),
                });
            }
        }
    }

    /// Drops the observer with `id`. Returns `false` if it was not attached.
    pub(crate) fn detach_observer(&self, id: u64) -> bool {
        {
            let mut observers = lock(&self.inner.observers);
            let before = observers.len();
            observers.retain(|weak| weak.id() != id);
            if observers.len() == before {
                return false;
            }
        }
        self.schedule_gc();
        true
    }

    /// Runs the mutation with `variables`.
    ///
    /// The lifecycle keeps running on the tokio runtime even if the returned
    /// promise is dropped.
    pub fn execute(&self, variables: Value) -> Promise<Value> {
        let options = self.options();
        let network_mode = options.network_mode.unwrap_or_default();
        let is_paused = !can_fetch(network_mode, &self.inner.env.online);
        let restored = self.state().status == MutationStatus::Pending;

        if !restored {
            self.dispatch(MutationAction::Pending {
                variables: variables.clone(),
                context: None,
                is_paused,
            });
            if let Some(cache) = self.cache() {
                if let Some(on_mutate) = &cache.config().on_mutate {
                    on_mutate(&variables, self);
                }
            }
            if let Some(on_mutate) = &options.on_mutate {
                let context = on_mutate(&variables);
                if context != self.state().context {
                    self.dispatch(MutationAction::Pending {
                        variables: variables.clone(),
                        context,
                        is_paused,
                    });
                }
            }
        }

        debug!(mutation_id = self.inner.mutation_id, restored, "executing mutation");
        let retryer = Retryer::new(self.retryer_config(&options, variables.clone()));
        *lock(&self.inner.retryer) = Some(retryer.clone());
        retryer.start();

        let this = self.clone();
        let promise = async move {
            let result = retryer.promise().await;
            this.finish(result, &variables)
        }
        .boxed()
        .shared();
        *lock(&self.inner.execution) = Some(promise.clone());

        let driver = promise.clone();
        timer::spawn(async move {
            let _ = driver.await;
        });
        promise
    }

    /// Continues a paused mutation, or re-runs a restored pending one.
    pub fn resume(&self) -> BoxFuture<'static, Result<Value, QueryError>> {
        let retryer = lock(&self.inner.retryer).clone();
        if let Some(retryer) = retryer {
            retryer.resume();
            let execution = lock(&self.inner.execution).clone();
            return match execution {
                Some(execution) => execution.boxed(),
                None => retryer.promise().boxed(),
            };
        }

        match self.state().variables {
            Some(variables) => self.execute(variables).boxed(),
            None => future::ready(Err(QueryError::Config(
                "paused mutation has no variables to replay".to_string(),
            )))
            .boxed(),
        }
    }

    fn retryer_config(&self, options: &MutationOptions, variables: Value) -> RetryerConfig<Value> {
        let mutation_fn = options.mutation_fn.clone();
        let operation: Operation<Value> = Arc::new(move |_signal| match &mutation_fn {
            Some(mutation_fn) => mutation_fn(variables.clone()),
            None => future::ready(Err(QueryError::MissingMutationFn)).boxed(),
        });

        let weak = Arc::downgrade(&self.inner);
        let mut config = RetryerConfig::new(
            operation,
            self.inner.env.focus.clone(),
            self.inner.env.online.clone(),
        );
        config.retry = options.retry.clone().unwrap_or(Retry::Never);
        config.retry_delay = options.retry_delay.clone().unwrap_or_default();
        config.network_mode = options.network_mode.unwrap_or_default();
        config.on_fail = Some(Arc::new({
            let weak = weak.clone();
            move |failure_count, error: &QueryError| {
                if let Some(mutation) = upgrade(&weak) {
                    mutation.dispatch(MutationAction::Failed {
                        failure_count,
                        error: error.clone(),
                    });
                }
            }
        }));
        config.on_pause = Some(Arc::new({
            let weak = weak.clone();
            move || {
                if let Some(mutation) = upgrade(&weak) {
                    mutation.dispatch(MutationAction::Pause);
                }
            }
        }));
        config.on_continue = Some(Arc::new(move || {
            if let Some(mutation) = upgrade(&weak) {
                mutation.dispatch(MutationAction::Continue);
            }
        }));
        config
    }

    fn finish(&self, result: Result<Value, QueryError>, variables: &Value) -> Result<Value, QueryError> {
        let options = self.options();
        let cache_config = self.cache().map(|cache| cache.config().clone());
        let context = self.state().context;
        let context = context.as_ref();

        match result {
            Ok(data) => {
                debug!(mutation_id = self.inner.mutation_id, "mutation succeeded");
                if let Some(hook) = cache_config.as_ref().and_then(|c| c.on_success.as_ref()) {
                    hook(&data, variables, context, self);
                }
                if let Some(hook) = &options.on_success {
                    hook(&data, variables, context);
                }
                if let Some(hook) = cache_config.as_ref().and_then(|c| c.on_settled.as_ref()) {
                    hook(Some(&data), None, variables, context, self);
                }
                if let Some(hook) = &options.on_settled {
                    hook(Some(&data), None, variables, context);
                }
                self.dispatch(MutationAction::Success { data: data.clone() });
                Ok(data)
            }
            Err(error) => {
                debug!(mutation_id = self.inner.mutation_id, %error, "mutation failed");
                if let Some(hook) = cache_config.as_ref().and_then(|c| c.on_error.as_ref()) {
                    hook(&error, variables, context, self);
                }
                if let Some(hook) = &options.on_error {
                    hook(&error, variables, context);
                }
                if let Some(hook) = cache_config.as_ref().and_then(|c| c.on_settled.as_ref()) {
                    hook(None, Some(&error), variables, context, self);
                }
                if let Some(hook) = &options.on_settled {
                    hook(None, Some(&error), variables, context);
                }
                self.dispatch(MutationAction::Error {
                    error: error.clone(),
                });
                Err(error)
            }
        }
    }

    fn dispatch(&self, action: MutationAction) {
        {
            let mut state = lock(&self.inner.state);
            let next = reduce(&state, &action);
            *state = next;
        }

        let observers = self.observers();
        let cache = self.cache();
        self.inner.env.notify.batch(|| {
            for observer in &observers {
                observer.on_mutation_update(&action);
            }
            if let Some(cache) = cache {
                cache.notify(MutationCacheEvent::Updated {
                    mutation: self.clone(),
                    action,
                });
            }
        });
    }

    fn gc_time(&self) -> Duration {
        lock(&self.inner.options).gc_time.unwrap_or(Duration::MAX)
    }

    fn schedule_gc(&self) {
        self.clear_gc();
        let weak = Arc::downgrade(&self.inner);
        let handle = timer::set_timeout(self.gc_time(), move || {
            if let Some(mutation) = upgrade(&weak) {
                mutation.optional_remove();
            }
        });
        *lock(&self.inner.gc) = handle;
    }

    pub(crate) fn clear_gc(&self) {
        let handle = lock(&self.inner.gc).take();
        drop(handle);
    }

    fn optional_remove(&self) {
        if self.observer_count() > 0 {
            return;
        }
        if self.state().status == MutationStatus::Pending {
            self.schedule_gc();
        } else if let Some(cache) = self.cache() {
            debug!(mutation_id = self.inner.mutation_id, "garbage collecting mutation");
            cache.remove(self);
        }
    }
}

fn upgrade(weak: &Weak<MutationInner>) -> Option<Mutation> {
    weak.upgrade().map(|inner| Mutation { inner })
}

fn reduce(state: &MutationState, action: &MutationAction) -> MutationState {
    match action {
        MutationAction::Failed {
            failure_count,
            error,
        } => MutationState {
            failure_count: *failure_count,
            failure_reason: Some(error.clone()),
            ..state.clone()
        },
        MutationAction::Pause => MutationState {
            is_paused: true,
            ..state.clone()
        },
        MutationAction::Continue => MutationState {
            is_paused: false,
            ..state.clone()
        },
        MutationAction::Pending {
            variables,
            context,
            is_paused,
        } => MutationState {
            context: context.clone(),
            data: None,
            error: None,
            failure_count: 0,
            failure_reason: None,
            is_paused: *is_paused,
            status: MutationStatus::Pending,
            variables: Some(variables.clone()),
            submitted_at: now_millis(),
        },
        MutationAction::Success { data } => MutationState {
            data: Some(data.clone()),
            error: None,
            failure_count: 0,
            failure_reason: None,
            is_paused: false,
            status: MutationStatus::Success,
            ..state.clone()
        },
        MutationAction::Error { error } => MutationState {
            data: None,
            error: Some(error.clone()),
            failure_count: state.failure_count + 1,
            failure_reason: Some(error.clone()),
            is_paused: false,
            status: MutationStatus::Error,
            ..state.clone()
        },
        MutationAction::SetState { state } => (**state).clone(),
    }
}
