//! Prelude module for convenient imports.
//!
//! ```
//! use query_engine::prelude::*;
//! ```
//!
//! # What's included
//!
//! - [`QueryClient`] - The facade over both caches
//! - [`QueryOptions`], [`QueryObserverOptions`], [`MutationOptions`] - Per-entity options
//! - [`QueryObserver`], [`QueriesObserver`], [`MutationObserver`] - Subscribable views
//! - [`QueryFilters`], [`MutationFilters`] - Cache selection
//! - [`QueryError`] - The error type of every operation
//! - [`query_key!`] - Builds keys from JSON-literal segments

pub use crate::client::{InvalidateOptions, QueryClient, RefetchOptions, RefetchType};
pub use crate::config::{
    MutationOptions, Placeholder, QueryConfig, QueryObserverOptions, QueryOptions, RefetchOn,
};
pub use crate::error::{CancelOptions, QueryError};
pub use crate::filters::{MutationFilters, QueryFilters, QueryTypeFilter};
pub use crate::key::QueryKey;
pub use crate::observer::{MutateOptions, MutationObserver, QueriesObserver, QueryObserver};
pub use crate::query::{FetchStatus, QueryStatus};
pub use crate::query_key;
pub use crate::retryer::{NetworkMode, Retry, RetryDelay};
