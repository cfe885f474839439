use std::fmt;
use std::sync::{Arc, LazyLock};

use super::{Cleanup, Setter, Signal};
use crate::subscription::Unsubscribe;

static GLOBAL: LazyLock<OnlineManager> = LazyLock::new(OnlineManager::new);

/// Tracks network reachability. Starts out online.
#[derive(Clone)]
pub struct OnlineManager {
    signal: Arc<Signal<bool>>,
}

impl Default for OnlineManager {
    fn default() -> Self {
        Self {
            signal: Signal::new(true, |online| *online),
        }
    }
}

impl fmt::Debug for OnlineManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnlineManager")
            .field("online", &self.is_online())
            .field("has_listeners", &self.has_listeners())
            .finish()
    }
}

impl OnlineManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide connectivity state.
    #[must_use]
    pub fn global() -> Self {
        GLOBAL.clone()
    }

    /// Replaces the platform adapter. See [`super::FocusManager::set_event_listener`].
    pub fn set_event_listener<F>(&self, setup: F)
    where
        F: Fn(Setter<bool>) -> Option<Cleanup> + Send + Sync + 'static,
    {
        self.signal.set_event_listener(Arc::new(setup));
    }

    /// Updates connectivity; listeners run synchronously when it changes.
    pub fn set_online(&self, online: bool) {
        self.signal.set(online);
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.signal.get()
    }

    pub fn subscribe(&self, listener: impl Fn(bool) + Send + Sync + 'static) -> Unsubscribe {
        self.signal.subscribe(listener)
    }

    #[must_use]
    pub fn has_listeners(&self) -> bool {
        self.signal.has_listeners()
    }
}
