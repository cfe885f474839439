//! Batched notification delivery.
//!
//! Every state change in the engine reaches listeners through a
//! [`NotifyManager`]. Inside a [`NotifyManager::batch`] scope callbacks are
//! queued; when the outermost scope exits the queue is flushed in enqueue
//! order. The three delivery functions are pluggable so a host can route
//! flushes onto its own event loop.

use std::sync::{Arc, LazyLock, Mutex};

use tracing::trace;

use crate::utils::lock;

/// A queued notification.
pub type Callback = Box<dyn FnOnce() + Send>;

/// Runs one queued callback. Defaults to calling it directly.
pub type NotifyFunction = Arc<dyn Fn(Callback) + Send + Sync>;

/// Wraps the delivery of one whole flush. Defaults to calling it directly.
pub type BatchNotifyFunction = Arc<dyn Fn(Callback) + Send + Sync>;

/// Decides when a flush runs. Defaults to running it synchronously.
pub type ScheduleFunction = Arc<dyn Fn(Callback) + Send + Sync>;

static GLOBAL: LazyLock<NotifyManager> = LazyLock::new(NotifyManager::new);

#[derive(Clone)]
struct Functions {
    notify: NotifyFunction,
    batch_notify: BatchNotifyFunction,
    schedule: ScheduleFunction,
}

impl Default for Functions {
    fn default() -> Self {
        Self {
            notify: Arc::new(|callback| callback()),
            batch_notify: Arc::new(|callback| callback()),
            schedule: Arc::new(|callback| callback()),
        }
    }
}

#[derive(Default)]
struct State {
    transactions: usize,
    queue: Vec<Callback>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    functions: Mutex<Functions>,
}

/// Handle to a notification scheduler. Clones share the same queue.
#[derive(Clone, Default)]
pub struct NotifyManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for NotifyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.inner.state);
        f.debug_struct("NotifyManager")
            .field("transactions", &state.transactions)
            .field("queued", &state.queue.len())
            .finish()
    }
}

/// Closes a batch scope even if the batched closure panics.
struct BatchGuard<'a> {
    manager: &'a NotifyManager,
}

impl Drop for BatchGuard<'_> {
    fn drop(&mut self) {
        let outermost = {
            let mut state = lock(&self.manager.inner.state);
            state.transactions = state.transactions.saturating_sub(1);
            state.transactions == 0
        };
        if outermost {
            self.manager.flush();
        }
    }
}

impl NotifyManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide scheduler for callers that do not inject their own.
    #[must_use]
    pub fn global() -> Self {
        GLOBAL.clone()
    }

    /// Runs `f` with notifications deferred until the outermost batch exits.
    pub fn batch<T>(&self, f: impl FnOnce() -> T) -> T {
        lock(&self.inner.state).transactions += 1;
        let _guard = BatchGuard { manager: self };
        f()
    }

    /// Queues `callback` inside a batch, otherwise delivers it right away.
    pub fn schedule(&self, callback: impl FnOnce() + Send + 'static) {
        {
            let mut state = lock(&self.inner.state);
            if state.transactions > 0 {
                state.queue.push(Box::new(callback));
                return;
            }
        }
        let functions = self.functions();
        let notify = functions.notify;
        (functions.schedule)(Box::new(move || notify(Box::new(callback))));
    }

    /// Wraps `f` so that every call is routed through [`Self::schedule`].
    pub fn batch_calls<A, F>(&self, f: F) -> impl Fn(A) + Send + Sync + 'static
    where
        A: Send + 'static,
        F: Fn(A) + Send + Sync + 'static,
    {
        let manager = self.clone();
        let f = Arc::new(f);
        move |arg| {
            let f = Arc::clone(&f);
            manager.schedule(move || f(arg));
        }
    }

    pub fn set_notify_function(&self, notify: impl Fn(Callback) + Send + Sync + 'static) {
        lock(&self.inner.functions).notify = Arc::new(notify);
    }

    pub fn set_batch_notify_function(
        &self,
        batch_notify: impl Fn(Callback) + Send + Sync + 'static,
    ) {
        lock(&self.inner.functions).batch_notify = Arc::new(batch_notify);
    }

    pub fn set_scheduler(&self, schedule: impl Fn(Callback) + Send + Sync + 'static) {
        lock(&self.inner.functions).schedule = Arc::new(schedule);
    }

    /// Number of currently open batch scopes.
    #[must_use]
    pub fn depth(&self) -> usize {
        lock(&self.inner.state).transactions
    }

    fn functions(&self) -> Functions {
        lock(&self.inner.functions).clone()
    }

    fn flush(&self) {
        let queue = std::mem::take(&mut lock(&self.inner.state).queue);
        if queue.is_empty() {
            return;
        }
        trace!(count = queue.len(), "flushing notifications");

        let Functions {
            notify,
            batch_notify,
            schedule,
        } = self.functions();
        let manager = self.clone();
        // Delivery runs inside a batch, so anything scheduled by a callback
        // is collected and flushed as a follow-up pass.
        schedule(Box::new(move || {
            batch_notify(Box::new(move || {
                manager.batch(|| {
                    for callback in queue {
                        notify(callback);
                    }
                });
            }));
        }));
    }
}
