//! # query-engine - keyed async query and mutation cache
//!
//! An in-memory cache for asynchronous reads ("queries") and writes
//! ("mutations"), built on tokio. Queries are addressed by structured
//! [`QueryKey`]s; concurrent fetches of the same key are deduplicated,
//! failures are retried with backoff, work pauses while offline and resumes
//! on reconnect, and observers receive batched, structurally shared results.
//!
//! ## Architecture
//!
//! 1. **Keys**: [`QueryKey`] hashes canonically, so deeply equal keys share
//!    one cache entry.
//! 2. **Entities**: a [`Query`] or [`Mutation`] owns its state machine and
//!    drives its operation through a [`Retryer`](retryer::Retryer).
//! 3. **Caches**: [`QueryCache`] and [`MutationCache`] index entities and
//!    broadcast lifecycle events.
//! 4. **Observers**: [`QueryObserver`], [`QueriesObserver`] and
//!    [`MutationObserver`] derive results and notify listeners.
//! 5. **Environment**: [`NotifyManager`], [`FocusManager`] and
//!    [`OnlineManager`] batch notifications and signal focus/connectivity.
//!
//! ## Core Components
//!
//! - [`QueryClient`]: the facade applications talk to
//! - [`QueryObserver`]: a subscribable view of one query
//! - [`MutationObserver`]: runs mutations and tracks the latest one
//! - [`hydration`]: serializable snapshots of a client
//!
//! ## Example
//!
//! ```rust
//! use query_engine::prelude::*;
//! use serde_json::json;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), QueryError> {
//!     let client = QueryClient::new();
//!     let options = QueryOptions::new(query_key!["todos", 1])
//!         .query_fn(|_ctx| async { Ok(json!({ "id": 1, "title": "write docs" })) });
//!
//!     let data = client.fetch_query(options).await?;
//!     assert_eq!(data["title"], "write docs");
//!     assert!(client.get_query_data(query_key!["todos", 1]).is_some());
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod config;
pub mod environment;
pub mod error;
pub mod filters;
pub mod hydration;
pub mod key;
pub mod mutation;
pub mod mutation_cache;
pub mod notify;
pub mod observer;
pub mod prelude;
pub mod query;
pub mod query_cache;
pub mod retryer;
pub mod subscription;
pub mod timer;
pub mod utils;

pub use client::{InvalidateOptions, QueryClient, QueryClientConfig, RefetchOptions, RefetchType};
pub use config::{MutationOptions, QueryConfig, QueryObserverOptions, QueryOptions};
pub use environment::{Environment, FocusManager, OnlineManager};
pub use error::{CancelOptions, CancelledError, QueryError};
pub use filters::{MutationFilters, QueryFilters, QueryTypeFilter};
pub use key::{MutationKey, QueryKey};
pub use mutation::{Mutation, MutationState, MutationStatus};
pub use mutation_cache::{MutationCache, MutationCacheConfig, MutationCacheEvent};
pub use notify::NotifyManager;
pub use observer::{
    MutateOptions, MutationObserver, MutationObserverResult, QueriesObserver, QueryObserver,
    QueryObserverResult,
};
pub use query::{FetchStatus, Query, QueryState, QueryStatus};
pub use query_cache::{QueryCache, QueryCacheConfig, QueryCacheEvent};

#[doc(hidden)]
pub use serde_json as __serde_json;
