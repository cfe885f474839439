use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use super::query::{QueryObserver, QueryObserverResult};
use crate::client::QueryClient;
use crate::config::QueryObserverOptions;
use crate::subscription::{ListenerSet, ResultStream, Unsubscribe, stream_from};
use crate::utils::lock;

struct Inner {
    client: QueryClient,
    observers: Mutex<Vec<QueryObserver>>,
    listeners: ListenerSet<Vec<QueryObserverResult>>,
    delivery_pending: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for observer in lock(&self.observers).iter() {
            observer.destroy();
        }
    }
}

/// Observes a list of queries and reports their results together.
///
/// Updates of several queries inside one notification batch produce a
/// single notification.
#[derive(Clone)]
pub struct QueriesObserver {
    inner: Arc<Inner>,
}

impl fmt::Debug for QueriesObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueriesObserver")
            .field("queries", &lock(&self.inner.observers).len())
            .field("listeners", &self.inner.listeners.len())
            .finish_non_exhaustive()
    }
}

impl QueriesObserver {
    pub fn new(client: &QueryClient, queries: Vec<QueryObserverOptions>) -> Self {
        let observer = Self {
            inner: Arc::new(Inner {
                client: client.clone(),
                observers: Mutex::new(Vec::new()),
                listeners: ListenerSet::new(),
                delivery_pending: AtomicBool::new(false),
            }),
        };
        observer.set_queries(queries);
        observer
    }

    #[must_use]
    pub fn has_listeners(&self) -> bool {
        !self.inner.listeners.is_empty()
    }

    /// Replaces the observed queries. Observers of queries that stay in the
    /// list are kept; only added and removed queries are (un)mounted.
    pub fn set_queries(&self, queries: Vec<QueryObserverOptions>) {
        let notify = self.inner.client.env().notify.clone();
        notify.batch(|| {
            let prev = lock(&self.inner.observers).clone();
            let matches = self.find_matching_observers(&prev, queries);
            for (observer, options) in &matches {
                observer.set_options(options.clone());
            }
            let next: Vec<QueryObserver> = matches.into_iter().map(|(observer, _)| observer).collect();

            let unchanged = prev.len() == next.len()
                && prev.iter().zip(&next).all(|(a, b)| a.id() == b.id());
            if unchanged {
                return;
            }
            *lock(&self.inner.observers) = next.clone();
            if !self.has_listeners() {
                return;
            }

            for observer in prev.iter().filter(|p| !next.iter().any(|n| n.id() == p.id())) {
                observer.destroy();
            }
            for observer in next.iter().filter(|n| !prev.iter().any(|p| p.id() == n.id())) {
                self.attach(observer);
            }
            self.schedule_delivery();
        });
    }

    fn find_matching_observers(
        &self,
        prev: &[QueryObserver],
        queries: Vec<QueryObserverOptions>,
    ) -> Vec<(QueryObserver, QueryObserverOptions)> {
        let mut by_hash: HashMap<String, QueryObserver> = prev
            .iter()
            .map(|observer| (observer.options().query.hash(), observer.clone()))
            .collect();
        queries
            .into_iter()
            .map(|options| {
                let options = self.inner.client.default_query_options(options);
                let observer = by_hash
                    .remove(&options.query.hash())
                    .unwrap_or_else(|| QueryObserver::new(&self.inner.client, options.clone()));
                (observer, options)
            })
            .collect()
    }

    fn attach(&self, observer: &QueryObserver) {
        let weak = Arc::downgrade(&self.inner);
        let _subscription = observer.subscribe(move |_| {
            if let Some(inner) = weak.upgrade() {
                QueriesObserver { inner }.schedule_delivery();
            }
        });
    }

    /// Current results, in query order.
    #[must_use]
    pub fn get_current_result(&self) -> Vec<QueryObserverResult> {
        current_results(&self.inner)
    }

    /// Results the given list would produce right now.
    pub fn get_optimistic_result(
        &self,
        queries: Vec<QueryObserverOptions>,
    ) -> Vec<QueryObserverResult> {
        let prev = lock(&self.inner.observers).clone();
        self.find_matching_observers(&prev, queries)
            .into_iter()
            .map(|(observer, options)| observer.get_optimistic_result(options))
            .collect()
    }

    pub fn subscribe(
        &self,
        listener: impl Fn(&Vec<QueryObserverResult>) + Send + Sync + 'static,
    ) -> Unsubscribe {
        let id = self.inner.listeners.add(Arc::new(listener));
        if self.inner.listeners.len() == 1 {
            let observers = lock(&self.inner.observers).clone();
            for observer in &observers {
                self.attach(observer);
            }
        }
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        Unsubscribe::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.listeners.remove(id);
                if inner.listeners.is_empty() {
                    QueriesObserver { inner }.destroy();
                }
            }
        })
    }

    pub fn stream(&self) -> ResultStream<Vec<QueryObserverResult>> {
        stream_from(Some(self.get_current_result()), |tx| {
            self.subscribe(move |results| {
                let _ = tx.send(results.clone());
            })
        })
    }

    /// Unmounts every query observer and drops all listeners.
    pub fn destroy(&self) {
        self.inner.listeners.clear();
        let observers = lock(&self.inner.observers).clone();
        for observer in &observers {
            observer.destroy();
        }
    }

    fn schedule_delivery(&self) {
        if self.inner.delivery_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        self.inner.client.env().notify.schedule(move || {
            if let Some(inner) = weak.upgrade() {
                inner.delivery_pending.store(false, Ordering::SeqCst);
                let results = current_results(&inner);
                inner.listeners.emit(&results);
            }
        });
    }
}

fn current_results(inner: &Inner) -> Vec<QueryObserverResult> {
    lock(&inner.observers)
        .iter()
        .map(QueryObserver::get_current_result)
        .collect()
}
