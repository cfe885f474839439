//! Filters selecting queries and mutations in a cache.

use std::fmt;
use std::sync::Arc;

use crate::error::QueryError;
use crate::key::{MutationKey, QueryKey, partial_match_key};
use crate::mutation::{Mutation, MutationStatus};
use crate::query::{FetchStatus, Query, QueryStatus};

type QueryPredicate = Arc<dyn Fn(&Query) -> bool + Send + Sync>;
type MutationPredicate = Arc<dyn Fn(&Mutation) -> bool + Send + Sync>;

/// Which queries to match by observer activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum QueryTypeFilter {
    #[default]
    All,
    /// Queries with at least one enabled observer.
    Active,
    Inactive,
}

/// Selects queries. Every set criterion must match.
#[derive(Clone, Default)]
pub struct QueryFilters {
    /// Prefix-matched unless `exact` is set.
    pub query_key: Option<QueryKey>,
    pub exact: Option<bool>,
    pub kind: QueryTypeFilter,
    pub stale: Option<bool>,
    pub fetch_status: Option<FetchStatus>,
    pub status: Option<QueryStatus>,
    pub predicate: Option<QueryPredicate>,
}

impl fmt::Debug for QueryFilters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryFilters")
            .field("query_key", &self.query_key)
            .field("exact", &self.exact)
            .field("kind", &self.kind)
            .field("stale", &self.stale)
            .field("fetch_status", &self.fetch_status)
            .field("status", &self.status)
            .field("predicate", &self.predicate.as_ref().map(|_| ".."))
            .finish()
    }
}

impl QueryFilters {
    /// Matches every query.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Matches queries whose key starts with `key`.
    pub fn key(key: impl Into<QueryKey>) -> Self {
        Self {
            query_key: Some(key.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn exact(mut self, exact: bool) -> Self {
        self.exact = Some(exact);
        self
    }

    #[must_use]
    pub const fn kind(mut self, kind: QueryTypeFilter) -> Self {
        self.kind = kind;
        self
    }

    #[must_use]
    pub const fn stale(mut self, stale: bool) -> Self {
        self.stale = Some(stale);
        self
    }

    #[must_use]
    pub const fn fetch_status(mut self, fetch_status: FetchStatus) -> Self {
        self.fetch_status = Some(fetch_status);
        self
    }

    #[must_use]
    pub const fn status(mut self, status: QueryStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn predicate(mut self, f: impl Fn(&Query) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(f));
        self
    }

    /// Rejects combinations that cannot match anything meaningful.
    pub fn validate(&self) -> Result<(), QueryError> {
        if self.exact == Some(true) && self.query_key.is_none() {
            return Err(QueryError::Config(
                "`exact` query filter requires a query key".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn matches(&self, query: &Query) -> bool {
        if let Some(key) = &self.query_key {
            if self.exact.unwrap_or(false) {
                if query.query_hash() != key.hash() {
                    return false;
                }
            } else if !partial_match_key(query.query_key(), key) {
                return false;
            }
        }

        match self.kind {
            QueryTypeFilter::All => {}
            QueryTypeFilter::Active if !query.is_active() => return false,
            QueryTypeFilter::Inactive if query.is_active() => return false,
            QueryTypeFilter::Active | QueryTypeFilter::Inactive => {}
        }

        if self.stale.is_some_and(|stale| query.is_stale() != stale) {
            return false;
        }

        if self.fetch_status.is_some() || self.status.is_some() {
            let state = query.state();
            if self
                .fetch_status
                .is_some_and(|fetch_status| fetch_status != state.fetch_status)
            {
                return false;
            }
            if self.status.is_some_and(|status| status != state.status) {
                return false;
            }
        }

        self.predicate
            .as_ref()
            .is_none_or(|predicate| predicate(query))
    }
}

/// Selects mutations. Every set criterion must match.
#[derive(Clone, Default)]
pub struct MutationFilters {
    pub mutation_key: Option<MutationKey>,
    pub exact: Option<bool>,
    pub status: Option<MutationStatus>,
    pub predicate: Option<MutationPredicate>,
}

impl fmt::Debug for MutationFilters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationFilters")
            .field("mutation_key", &self.mutation_key)
            .field("exact", &self.exact)
            .field("status", &self.status)
            .field("predicate", &self.predicate.as_ref().map(|_| ".."))
            .finish()
    }
}

impl MutationFilters {
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    pub fn key(key: impl Into<MutationKey>) -> Self {
        Self {
            mutation_key: Some(key.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn exact(mut self, exact: bool) -> Self {
        self.exact = Some(exact);
        self
    }

    #[must_use]
    pub const fn status(mut self, status: MutationStatus) -> Self {
        self.status = Some(status);
        self
    }

    #[must_use]
    pub fn predicate(mut self, f: impl Fn(&Mutation) -> bool + Send + Sync + 'static) -> Self {
        self.predicate = Some(Arc::new(f));
        self
    }

    pub fn validate(&self) -> Result<(), QueryError> {
        if self.exact == Some(true) && self.mutation_key.is_none() {
            return Err(QueryError::Config(
                "`exact` mutation filter requires a mutation key".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn matches(&self, mutation: &Mutation) -> bool {
        if let Some(key) = &self.mutation_key {
            let Some(own) = mutation.mutation_key() else {
                return false;
            };
            if self.exact.unwrap_or(false) {
                if own.hash() != key.hash() {
                    return false;
                }
            } else if !partial_match_key(&own, key) {
                return false;
            }
        }

        if self
            .status
            .is_some_and(|status| status != mutation.state().status)
        {
            return false;
        }

        self.predicate
            .as_ref()
            .is_none_or(|predicate| predicate(mutation))
    }
}
