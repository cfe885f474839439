use std::fmt;
use std::sync::{Arc, LazyLock};

use super::{Cleanup, Setter, Signal};
use crate::subscription::Unsubscribe;

static GLOBAL: LazyLock<FocusManager> = LazyLock::new(FocusManager::new);

/// Tracks whether the host application is focused.
///
/// The state starts out unknown, which counts as focused.
#[derive(Clone)]
pub struct FocusManager {
    signal: Arc<Signal<Option<bool>>>,
}

impl Default for FocusManager {
    fn default() -> Self {
        Self {
            signal: Signal::new(None, |focused| focused.unwrap_or(true)),
        }
    }
}

impl fmt::Debug for FocusManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FocusManager")
            .field("focused", &self.is_focused())
            .field("has_listeners", &self.has_listeners())
            .finish()
    }
}

impl FocusManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide focus state.
    #[must_use]
    pub fn global() -> Self {
        GLOBAL.clone()
    }

    /// Replaces the platform adapter.
    ///
    /// The previous adapter is cleaned up immediately. The new one starts
    /// right away if there are subscribers, otherwise with the first one.
    pub fn set_event_listener<F>(&self, setup: F)
    where
        F: Fn(Setter<Option<bool>>) -> Option<Cleanup> + Send + Sync + 'static,
    {
        self.signal.set_event_listener(Arc::new(setup));
    }

    /// `None` resets to "unknown", which is treated as focused.
    pub fn set_focused(&self, focused: Option<bool>) {
        self.signal.set(focused);
    }

    #[must_use]
    pub fn is_focused(&self) -> bool {
        self.signal.get()
    }

    /// Re-announces the current focus state to every listener.
    pub fn on_focus(&self) {
        self.signal.emit();
    }

    /// Registers `listener`, called with the new focus state on every change.
    pub fn subscribe(&self, listener: impl Fn(bool) + Send + Sync + 'static) -> Unsubscribe {
        self.signal.subscribe(listener)
    }

    #[must_use]
    pub fn has_listeners(&self) -> bool {
        self.signal.has_listeners()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_defaults_to_focused() {
        let focus = FocusManager::new();
        assert!(focus.is_focused());
        focus.set_focused(Some(false));
        assert!(!focus.is_focused());
        focus.set_focused(None);
        assert!(focus.is_focused());
    }

    #[test]
    fn test_listeners_notified_on_change_only() {
        let focus = FocusManager::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let unsubscribe = focus.subscribe(move |focused| sink.lock().expect("lock").push(focused));

        focus.set_focused(Some(true));
        focus.set_focused(Some(true));
        focus.set_focused(Some(false));
        assert_eq!(*seen.lock().expect("lock"), vec![true, false]);

        unsubscribe.unsubscribe();
        focus.set_focused(Some(true));
        assert_eq!(seen.lock().expect("lock").len(), 2);
    }

    #[test]
    fn test_adapter_runs_only_while_subscribed() {
        let focus = FocusManager::new();
        let setups = Arc::new(AtomicUsize::new(0));
        let cleanups = Arc::new(AtomicUsize::new(0));
        let slot: Arc<Mutex<Option<Setter<Option<bool>>>>> = Arc::new(Mutex::new(None));

        let (setup_count, cleanup_count, setter_slot) =
            (Arc::clone(&setups), Arc::clone(&cleanups), Arc::clone(&slot));
        focus.set_event_listener(move |setter| {
            setup_count.fetch_add(1, Ordering::SeqCst);
            *setter_slot.lock().expect("lock") = Some(setter);
            let cleanup_count = Arc::clone(&cleanup_count);
            Some(Box::new(move || {
                cleanup_count.fetch_add(1, Ordering::SeqCst);
            }) as Cleanup)
        });
        assert_eq!(setups.load(Ordering::SeqCst), 0);

        let first = focus.subscribe(|_| {});
        let second = focus.subscribe(|_| {});
        assert_eq!(setups.load(Ordering::SeqCst), 1);

        let setter = slot.lock().expect("lock").clone().expect("adapter should have started");
        setter(Some(false));
        assert!(!focus.is_focused());

        first.unsubscribe();
        assert_eq!(cleanups.load(Ordering::SeqCst), 0);
        second.unsubscribe();
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);

        let third = focus.subscribe(|_| {});
        assert_eq!(setups.load(Ordering::SeqCst), 2);
        third.unsubscribe();
        assert_eq!(cleanups.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_replacing_adapter_cleans_up_previous() {
        let focus = FocusManager::new();
        let cleanups = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&cleanups);
        focus.set_event_listener(move |_| {
            let counter = Arc::clone(&counter);
            Some(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }) as Cleanup)
        });
        let _subscription = focus.subscribe(|_| {});

        let replaced = Arc::new(AtomicUsize::new(0));
        let started = Arc::clone(&replaced);
        focus.set_event_listener(move |_| {
            started.fetch_add(1, Ordering::SeqCst);
            None
        });
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert_eq!(replaced.load(Ordering::SeqCst), 1);
    }
}
