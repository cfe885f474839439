//! Error types shared by queries, mutations and the retry engine.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for query and mutation operations.
///
/// Operation functions return this type directly, so it is also the
/// "anything the operation rejected with" bucket. It is `Clone` because a
/// single in-flight fetch hands the same outcome to every deduplicated caller.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryError {
    #[error("Fetch failed: {0}")]
    Fetch(String),

    #[error("Network error: {0}")]
    Network(String),

    /// The operation was deliberately abandoned. Never counted against the
    /// retry budget.
    #[error(transparent)]
    Cancelled(#[from] CancelledError),

    #[error("Missing query function for query {hash}")]
    MissingQueryFn { hash: String },

    #[error("Missing mutation function")]
    MissingMutationFn,

    /// Invalid filters or options, reported at call time.
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to decode cached data: {0}")]
    Decode(String),

    /// The background task driving an operation could not run or panicked.
    #[error("Background task failed: {0}")]
    TaskFailed(String),
}

impl QueryError {
    /// Convenience constructor for operation failures.
    pub fn fetch(reason: impl fmt::Display) -> Self {
        Self::Fetch(reason.to_string())
    }

    /// Returns `true` if this error signals cancellation rather than failure.
    #[must_use]
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Returns the cancellation details if this is a cancellation.
    #[must_use]
    pub const fn as_cancelled(&self) -> Option<&CancelledError> {
        match self {
            Self::Cancelled(cancelled) => Some(cancelled),
            _ => None,
        }
    }
}

/// Distinguished error produced when a running operation is cancelled.
#[derive(Error, Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[error("Operation cancelled")]
pub struct CancelledError {
    /// The owning entity restores the state it had before the fetch started.
    pub revert: bool,
    /// The owning entity records nothing for this cancellation.
    pub silent: bool,
}

/// Options accepted by every `cancel` entry point.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CancelOptions {
    pub revert: bool,
    pub silent: bool,
}

impl CancelOptions {
    /// Cancel and restore the pre-fetch state.
    #[must_use]
    pub const fn revert() -> Self {
        Self {
            revert: true,
            silent: false,
        }
    }

    /// Cancel without recording anything on the entity.
    #[must_use]
    pub const fn silent() -> Self {
        Self {
            revert: false,
            silent: true,
        }
    }
}

impl From<CancelOptions> for CancelledError {
    fn from(options: CancelOptions) -> Self {
        Self {
            revert: options.revert,
            silent: options.silent,
        }
    }
}
