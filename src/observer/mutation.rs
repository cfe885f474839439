use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use serde_json::Value;

use super::next_observer_id;
use crate::client::QueryClient;
use crate::config::{MutationOptions, OnMutationErrorFn, OnMutationSettledFn, OnMutationSuccessFn};
use crate::error::QueryError;
use crate::mutation::{Mutation, MutationAction, MutationState, MutationStatus};
use crate::mutation_cache::MutationCacheEvent;
use crate::subscription::{ListenerSet, ResultStream, Unsubscribe, stream_from};
use crate::utils::lock;

/// State of the observed mutation plus status flags.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationObserverResult {
    #[serde(flatten)]
    pub state: MutationState,
    pub is_idle: bool,
    pub is_pending: bool,
    pub is_success: bool,
    pub is_error: bool,
}

impl MutationObserverResult {
    fn from_state(state: MutationState) -> Self {
        Self {
            is_idle: state.status == MutationStatus::Idle,
            is_pending: state.status == MutationStatus::Pending,
            is_success: state.status == MutationStatus::Success,
            is_error: state.status == MutationStatus::Error,
            state,
        }
    }
}

/// Callbacks for a single `mutate` call.
///
/// They only fire while the observer has listeners, and only for the most
/// recent call.
#[derive(Clone, Default)]
pub struct MutateOptions {
    pub on_success: Option<OnMutationSuccessFn>,
    pub on_error: Option<OnMutationErrorFn>,
    pub on_settled: Option<OnMutationSettledFn>,
}

impl fmt::Debug for MutateOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutateOptions")
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_settled", &self.on_settled.is_some())
            .finish()
    }
}

impl MutateOptions {
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
}

struct ObserverState {
    options: MutationOptions,
    current_mutation: Option<Mutation>,
    current_result: MutationObserverResult,
    mutate_options: Option<MutateOptions>,
}

struct ObserverInner {
    id: u64,
    client: QueryClient,
    state: Mutex<ObserverState>,
    listeners: ListenerSet<MutationObserverResult>,
}

impl Drop for ObserverInner {
    fn drop(&mut self) {
        if let Some(mutation) = lock(&self.state).current_mutation.clone() {
            mutation.detach_observer(self.id);
        }
    }
}

/// Runs mutations and tracks the most recent one.
#[derive(Clone)]
pub struct MutationObserver {
    inner: Arc<ObserverInner>,
}

#[derive(Clone)]
pub(crate) struct WeakMutationObserver {
    id: u64,
    inner: Weak<ObserverInner>,
}

impl WeakMutationObserver {
    pub(crate) const fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn upgrade(&self) -> Option<MutationObserver> {
        self.inner.upgrade().map(|inner| MutationObserver { inner })
    }
}

impl fmt::Debug for MutationObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("MutationObserver")
            .field("id", &self.inner.id)
            .field(
                "mutation_id",
                &state.current_mutation.as_ref().map(Mutation::mutation_id),
            )
            .finish_non_exhaustive()
    }
}

impl MutationObserver {
    pub fn new(client: &QueryClient, options: MutationOptions) -> Self {
        Self {
            inner: Arc::new(ObserverInner {
                id: next_observer_id(),
                client: client.clone(),
                state: Mutex::new(ObserverState {
                    options: client.default_mutation_options(options),
                    current_mutation: None,
                    current_result: MutationObserverResult::from_state(MutationState::default()),
                    mutate_options: None,
                }),
                listeners: ListenerSet::new(),
            }),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub(crate) fn downgrade(&self) -> WeakMutationObserver {
        WeakMutationObserver {
            id: self.inner.id,
            inner: Arc::downgrade(&self.inner),
        }
    }

    #[must_use]
    pub fn options(&self) -> MutationOptions {
        lock(&self.inner.state).options.clone()
    }

    #[must_use]
    pub fn has_listeners(&self) -> bool {
        !self.inner.listeners.is_empty()
    }

    /// Replaces the options. Changing the mutation key resets the observer;
    /// otherwise a pending mutation picks up the new options.
    pub fn set_options(&self, options: MutationOptions) {
        let options = self.inner.client.default_mutation_options(options);
        let (prev_key, current) = {
            let mut state = lock(&self.inner.state);
            let prev = std::mem::replace(&mut state.options, options.clone());
            (prev.mutation_key, state.current_mutation.clone())
        };
        self.inner
            .client
            .mutation_cache()
            .notify(MutationCacheEvent::ObserverOptionsUpdated {
                mutation: current.clone(),
                observer: self.clone(),
            });

        let key_changed = match (&prev_key, &options.mutation_key) {
            (Some(prev), Some(next)) => prev.hash() != next.hash(),
            _ => false,
        };
        if key_changed {
            self.reset();
        } else if let Some(mutation) = current {
            if mutation.state().status == MutationStatus::Pending {
                mutation.set_options(options);
            }
        }
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&MutationObserverResult) + Send + Sync + 'static,
    ) -> Unsubscribe {
        let id = self.inner.listeners.add(Arc::new(listener));
        let weak = self.downgrade();
        Unsubscribe::new(move || {
            if let Some(observer) = weak.upgrade() {
                observer.inner.listeners.remove(id);
                if !observer.has_listeners() {
                    let current = lock(&observer.inner.state).current_mutation.clone();
                    if let Some(mutation) = current {
                        mutation.remove_observer(&observer);
                    }
                }
            }
        })
    }

    pub fn stream(&self) -> ResultStream<MutationObserverResult> {
        stream_from(Some(self.get_current_result()), |tx| {
            self.subscribe(move |result| {
                let _ = tx.send(result.clone());
            })
        })
    }

    #[must_use]
    pub fn get_current_result(&self) -> MutationObserverResult {
        lock(&self.inner.state).current_result.clone()
    }

    /// Runs a new mutation. The previous one keeps running but is no longer
    /// tracked.
    pub async fn mutate(
        &self,
        variables: Value,
        options: MutateOptions,
    ) -> Result<Value, QueryError> {
        let (previous, mutation_options) = {
            let mut state = lock(&self.inner.state);
            state.mutate_options = Some(options);
            (state.current_mutation.take(), state.options.clone())
        };
        if let Some(previous) = previous {
            previous.remove_observer(self);
        }

        let mutation = self
            .inner
            .client
            .mutation_cache()
            .build(mutation_options, None);
        lock(&self.inner.state).current_mutation = Some(mutation.clone());
        mutation.add_observer(self);
        mutation.execute(variables).await
    }

    /// Forgets the current mutation and returns to the idle result.
    pub fn reset(&self) {
        let previous = lock(&self.inner.state).current_mutation.take();
        if let Some(previous) = previous {
            previous.remove_observer(self);
        }
        self.update_result();
        self.notify(None);
    }

    pub(crate) fn on_mutation_update(&self, action: &MutationAction) {
        self.update_result();
        self.notify(Some(action));
    }

    fn update_result(&self) {
        let mut state = lock(&self.inner.state);
        let mutation_state = state
            .current_mutation
            .as_ref()
            .map(Mutation::state)
            .unwrap_or_default();
        state.current_result = MutationObserverResult::from_state(mutation_state);
    }

    fn notify(&self, action: Option<&MutationAction>) {
        let (result, mutate_options) = {
            let state = lock(&self.inner.state);
            (state.current_result.clone(), state.mutate_options.clone())
        };
        self.inner.client.env().notify.batch(|| {
            if let Some(options) = mutate_options.filter(|_| self.has_listeners()) {
                let variables = result.state.variables.clone().unwrap_or(Value::Null);
                let context = result.state.context.as_ref();
                match action {
                    Some(MutationAction::Success { data }) => {
                        if let Some(on_success) = &options.on_success {
                            on_success(data, &variables, context);
                        }
                        if let Some(on_settled) = &options.on_settled {
                            on_settled(Some(data), None, &variables, context);
                        }
                    }
                    Some(MutationAction::Error { error }) => {
                        if let Some(on_error) = &options.on_error {
                            on_error(error, &variables, context);
                        }
                        if let Some(on_settled) = &options.on_settled {
                            on_settled(None, Some(error), &variables, context);
                        }
                    }
                    _ => {}
                }
            }
            self.inner.listeners.emit(&result);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn test_mutate_tracks_state() {
        let client = QueryClient::new();
        let observer = MutationObserver::new(
            &client,
            MutationOptions::new().mutation_fn(|vars| async move { Ok(json!({"echo": vars})) }),
        );
        let statuses = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&statuses);
        let _subscription = observer.subscribe(move |result| {
            sink.lock().expect("lock").push(result.state.status);
        });

        assert!(observer.get_current_result().is_idle);
        let data = observer.mutate(json!(1), MutateOptions::default()).await;
        assert_eq!(data, Ok(json!({"echo": 1})));
        let result = observer.get_current_result();
        assert!(result.is_success);
        assert_eq!(result.state.variables, Some(json!(1)));
        assert_eq!(
            *statuses.lock().expect("lock"),
            vec![MutationStatus::Pending, MutationStatus::Success]
        );

        observer.reset();
        assert!(observer.get_current_result().is_idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutate_options_need_listeners() {
        let client = QueryClient::new();
        let observer = MutationObserver::new(
            &client,
            MutationOptions::new().mutation_fn(|_| async { Err(QueryError::fetch("rejected")) }),
        );
        let errors = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&errors);
        let options = MutateOptions::default().on_error(move |error, _, _| {
            sink.lock().expect("lock").push(error.clone());
        });
        let _ = observer.mutate(json!(null), options.clone()).await;
        assert!(errors.lock().expect("lock").is_empty());

        let _subscription = observer.subscribe(|_| {});
        let result = observer.mutate(json!(null), options).await;
        assert_eq!(result, Err(QueryError::fetch("rejected")));
        assert_eq!(*errors.lock().expect("lock"), vec![QueryError::fetch("rejected")]);
        assert!(observer.get_current_result().is_error);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_mutation_retargets_observer() {
        let client = QueryClient::new();
        let observer = MutationObserver::new(
            &client,
            MutationOptions::new().mutation_fn(|vars| async move {
                let delay = vars.as_u64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(vars)
            }),
        );
        let _subscription = observer.subscribe(|_| {});

        let slow = {
            let observer = observer.clone();
            tokio::spawn(async move { observer.mutate(json!(50), MutateOptions::default()).await })
        };
        tokio::time::sleep(Duration::from_millis(1)).await;
        let fast = observer.mutate(json!(5), MutateOptions::default()).await;
        assert_eq!(fast, Ok(json!(5)));
        assert_eq!(slow.await.expect("task"), Ok(json!(50)));

        assert_eq!(observer.get_current_result().state.data, Some(json!(5)));
        assert_eq!(client.mutation_cache().get_all().len(), 2);
    }
}
