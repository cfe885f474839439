//! Observers: subscribable views over queries and mutations.
//!
//! An observer is inert until its first listener subscribes. From then on it
//! keeps its entity attached, derives a result on every entity update and
//! delivers changed results to its listeners through the notification
//! scheduler. Updates arriving within one batch are delivered once, with the
//! final result.

mod mutation;
mod queries;
mod query;

use std::sync::atomic::{AtomicU64, Ordering};

pub use mutation::{MutateOptions, MutationObserver, MutationObserverResult};
pub(crate) use mutation::WeakMutationObserver;
pub use queries::QueriesObserver;
pub use query::{QueryObserver, QueryObserverResult};
pub(crate) use query::WeakQueryObserver;

static NEXT_OBSERVER_ID: AtomicU64 = AtomicU64::new(1);

fn next_observer_id() -> u64 {
    NEXT_OBSERVER_ID.fetch_add(1, Ordering::Relaxed)
}
