//! Process-level signals the engine reacts to.
//!
//! [`FocusManager`] and [`OnlineManager`] track whether the host application
//! is focused and whether the network is reachable. Neither knows how to
//! observe the platform: the host installs an adapter with
//! `set_event_listener`, which receives a setter and may return a cleanup.
//! The adapter runs only while the manager has at least one subscriber.

mod focus;
mod online;

use std::sync::{Arc, Mutex, Weak};

use crate::notify::NotifyManager;
use crate::subscription::{ListenerSet, Unsubscribe};
use crate::utils::lock;

pub use focus::FocusManager;
pub use online::OnlineManager;

/// Pushes a new signal value into a manager.
pub type Setter<V> = Arc<dyn Fn(V) + Send + Sync>;

/// Tears an adapter down.
pub type Cleanup = Box<dyn FnOnce() + Send>;

/// Installs an adapter. Called with a setter each time the adapter starts.
pub type SetupFn<V> = Arc<dyn Fn(Setter<V>) -> Option<Cleanup> + Send + Sync>;

/// The shared services every client, cache, entity and observer is wired to.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    pub notify: NotifyManager,
    pub focus: FocusManager,
    pub online: OnlineManager,
}

impl Environment {
    /// Fresh, isolated managers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide managers.
    #[must_use]
    pub fn global() -> Self {
        Self {
            notify: NotifyManager::global(),
            focus: FocusManager::global(),
            online: OnlineManager::global(),
        }
    }
}

struct Adapter<V> {
    setup: Option<SetupFn<V>>,
    active: bool,
    cleanup: Option<Cleanup>,
}

/// Value + listeners + adapter lifecycle shared by both managers.
pub(crate) struct Signal<V> {
    value: Mutex<V>,
    project: fn(&V) -> bool,
    listeners: ListenerSet<bool>,
    adapter: Mutex<Adapter<V>>,
}

impl<V> Signal<V>
where
    V: Copy + PartialEq + Send + 'static,
{
    pub(crate) fn new(value: V, project: fn(&V) -> bool) -> Arc<Self> {
        Arc::new(Self {
            value: Mutex::new(value),
            project,
            listeners: ListenerSet::new(),
            adapter: Mutex::new(Adapter {
                setup: None,
                active: false,
                cleanup: None,
            }),
        })
    }

    pub(crate) fn get(&self) -> bool {
        (self.project)(&lock(&self.value))
    }

    /// Stores `value` and notifies listeners if it changed.
    pub(crate) fn set(&self, value: V) {
        {
            let mut current = lock(&self.value);
            if *current == value {
                return;
            }
            *current = value;
        }
        self.emit();
    }

    pub(crate) fn emit(&self) {
        let value = self.get();
        self.listeners.emit(&value);
    }

    pub(crate) fn has_listeners(&self) -> bool {
        !self.listeners.is_empty()
    }

    pub(crate) fn subscribe(
        self: &Arc<Self>,
        listener: impl Fn(bool) + Send + Sync + 'static,
    ) -> Unsubscribe {
        let id = self
            .listeners
            .add(Arc::new(move |value: &bool| listener(*value)));
        self.start();

        let weak = Arc::downgrade(self);
        Unsubscribe::new(move || {
            if let Some(signal) = weak.upgrade() {
                signal.listeners.remove(id);
                if !signal.has_listeners() {
                    signal.teardown();
                }
            }
        })
    }

    pub(crate) fn set_event_listener(self: &Arc<Self>, setup: SetupFn<V>) {
        lock(&self.adapter).setup = Some(setup);
        self.teardown();
        if self.has_listeners() {
            self.start();
        }
    }

    fn setter(self: &Arc<Self>) -> Setter<V> {
        let weak: Weak<Self> = Arc::downgrade(self);
        Arc::new(move |value| {
            if let Some(signal) = weak.upgrade() {
                signal.set(value);
            }
        })
    }

    fn start(self: &Arc<Self>) {
        let setup = {
            let mut adapter = lock(&self.adapter);
            if adapter.active {
                return;
            }
            let Some(setup) = adapter.setup.clone() else {
                return;
            };
            adapter.active = true;
            setup
        };

        let cleanup = setup(self.setter());

        let orphaned = {
            let mut adapter = lock(&self.adapter);
            if adapter.active {
                adapter.cleanup = cleanup;
                None
            } else {
                cleanup
            }
        };
        // Torn down while the setup ran.
        if let Some(cleanup) = orphaned {
            cleanup();
        }
    }

    fn teardown(&self) {
        let cleanup = {
            let mut adapter = lock(&self.adapter);
            adapter.active = false;
            adapter.cleanup.take()
        };
        if let Some(cleanup) = cleanup {
            cleanup();
        }
    }
}
