//! Listener registries, unsubscribe handles and result streams.
//!
//! Everything observable in the engine (caches, observers, environment
//! signals) keeps its listeners in a [`ListenerSet`] and hands callers an
//! [`Unsubscribe`] handle. Observers can also be consumed as a stream of
//! results through [`ResultStream`].

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::utils::lock;

/// Callback registered with [`ListenerSet::add`].
pub type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Identifier of a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

struct Entries<T> {
    next_id: u64,
    listeners: Vec<(ListenerId, Listener<T>)>,
}

/// Ordered set of listeners keyed by insertion id.
pub struct ListenerSet<T> {
    entries: Mutex<Entries<T>>,
}

impl<T> Default for ListenerSet<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(Entries {
                next_id: 0,
                listeners: Vec::new(),
            }),
        }
    }
}

impl<T> fmt::Debug for ListenerSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet")
            .field("len", &self.len())
            .finish()
    }
}

impl<T> ListenerSet<T> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` and returns its id.
    pub fn add(&self, listener: Listener<T>) -> ListenerId {
        let mut entries = lock(&self.entries);
        let id = ListenerId(entries.next_id);
        entries.next_id += 1;
        entries.listeners.push((id, listener));
        id
    }

    /// Removes a listener. Returns `true` if it was registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = lock(&self.entries);
        let before = entries.listeners.len();
        entries.listeners.retain(|(entry, _)| *entry != id);
        entries.listeners.len() != before
    }

    /// Copies the current listeners so they can be called without the lock.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Listener<T>> {
        lock(&self.entries)
            .listeners
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect()
    }

    /// Calls every listener registered at the time of the call.
    pub fn emit(&self, value: &T) {
        for listener in self.snapshot() {
            listener(value);
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.entries).listeners.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock(&self.entries).listeners.clear();
    }
}

/// Handle returned by every `subscribe` call.
///
/// Dropping the handle keeps the subscription alive; call
/// [`Unsubscribe::unsubscribe`] to detach.
#[must_use = "dropping an Unsubscribe handle keeps the listener registered"]
pub struct Unsubscribe(Option<Box<dyn FnOnce() + Send>>);

impl Unsubscribe {
    pub fn new(f: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(f)))
    }

    /// A handle that does nothing.
    pub fn noop() -> Self {
        Self(None)
    }

    /// Detaches the listener.
    pub fn unsubscribe(mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Unsubscribe")
            .field(&self.0.is_some())
            .finish()
    }
}

/// Stream of results pushed by an observer.
///
/// The underlying subscription is removed when the stream is dropped.
pub struct ResultStream<T> {
    inner: UnboundedReceiverStream<T>,
    unsubscribe: Option<Unsubscribe>,
}

impl<T> ResultStream<T> {
    /// Builds a stream from a receiver and the subscription feeding it.
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<T>, unsubscribe: Unsubscribe) -> Self {
        Self {
            inner: UnboundedReceiverStream::new(rx),
            unsubscribe: Some(unsubscribe),
        }
    }
}

impl<T> Stream for ResultStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

impl<T> Unpin for ResultStream<T> {}

impl<T> Drop for ResultStream<T> {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe.unsubscribe();
        }
    }
}

impl<T> fmt::Debug for ResultStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultStream").finish_non_exhaustive()
    }
}

/// Builds a result stream from a `subscribe`-style registration function.
///
/// The sender is handed to `register`, which returns the handle that detaches
/// it. `initial` is yielded first when present.
pub(crate) fn stream_from<T, R>(initial: Option<T>, register: R) -> ResultStream<T>
where
    T: Send + 'static,
    R: FnOnce(mpsc::UnboundedSender<T>) -> Unsubscribe,
{
    let (tx, rx) = mpsc::unbounded_channel();
    if let Some(initial) = initial {
        let _ = tx.send(initial);
    }
    let unsubscribe = register(tx);
    ResultStream::new(rx, unsubscribe)
}
