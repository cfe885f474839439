//! Serializable snapshots of a client's caches.
//!
//! [`dehydrate`] captures the queries and mutations worth persisting;
//! [`hydrate`] feeds such a snapshot back into a (possibly different) client.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::client::QueryClient;
use crate::config::{MutationOptions, QueryObserverOptions};
use crate::key::{MutationKey, QueryKey};
use crate::mutation::{Mutation, MutationState};
use crate::query::{FetchStatus, Query, QueryState, QueryStatus};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DehydratedState {
    pub mutations: Vec<DehydratedMutation>,
    pub queries: Vec<DehydratedQuery>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DehydratedQuery {
    pub query_key: QueryKey,
    pub query_hash: String,
    pub state: QueryState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DehydratedMutation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutation_key: Option<MutationKey>,
    pub state: MutationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<Value>,
}

type ShouldDehydrateQuery = Arc<dyn Fn(&Query) -> bool + Send + Sync>;
type ShouldDehydrateMutation = Arc<dyn Fn(&Mutation) -> bool + Send + Sync>;

/// Selects what [`dehydrate`] captures.
///
/// By default only successful queries and paused mutations are kept.
#[derive(Clone, Default)]
pub struct DehydrateOptions {
    pub should_dehydrate_query: Option<ShouldDehydrateQuery>,
    pub should_dehydrate_mutation: Option<ShouldDehydrateMutation>,
}

impl fmt::Debug for DehydrateOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DehydrateOptions")
            .field("should_dehydrate_query", &self.should_dehydrate_query.is_some())
            .field("should_dehydrate_mutation", &self.should_dehydrate_mutation.is_some())
            .finish()
    }
}

impl DehydrateOptions {
    #[must_use]
    pub fn should_dehydrate_query(mut self, f: impl Fn(&Query) -> bool + Send + Sync + 'static) -> Self {
        self.should_dehydrate_query = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn should_dehydrate_mutation(
        mut self,
        f: impl Fn(&Mutation) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.should_dehydrate_mutation = Some(Arc::new(f));
        self
    }
}

fn default_should_dehydrate_query(query: &Query) -> bool {
    query.state().status == QueryStatus::Success
}

fn default_should_dehydrate_mutation(mutation: &Mutation) -> bool {
    mutation.state().is_paused
}

/// Captures the selected queries and mutations of `client`.
#[must_use]
pub fn dehydrate(client: &QueryClient, options: &DehydrateOptions) -> DehydratedState {
    let mutations = client
        .mutation_cache()
        .get_all()
        .into_iter()
        .filter(|mutation| match &options.should_dehydrate_mutation {
            Some(should) => should(mutation),
            None => default_should_dehydrate_mutation(mutation),
        })
        .map(|mutation| DehydratedMutation {
            mutation_key: mutation.mutation_key(),
            state: mutation.state(),
            meta: mutation.meta(),
        })
        .collect();

    let queries = client
        .query_cache()
        .get_all()
        .into_iter()
        .filter(|query| match &options.should_dehydrate_query {
            Some(should) => should(query),
            None => default_should_dehydrate_query(query),
        })
        .map(|query| DehydratedQuery {
            query_key: query.query_key().clone(),
            query_hash: query.query_hash().to_string(),
            state: query.state(),
            meta: query.meta(),
        })
        .collect();

    DehydratedState { mutations, queries }
}

/// Restores a snapshot into `client`.
///
/// Existing queries are only overwritten by newer data, and keep their own
/// fetch status. Restored queries never appear to be fetching.
pub fn hydrate(client: &QueryClient, state: DehydratedState) {
    debug!(
        queries = state.queries.len(),
        mutations = state.mutations.len(),
        "hydrating client"
    );
    let notify = client.env().notify.clone();
    notify.batch(|| {
        for dehydrated in state.mutations {
            let mut options = MutationOptions::new();
            options.mutation_key = dehydrated.mutation_key;
            options.meta = dehydrated.meta;
            let options = client.default_mutation_options(options);
            client
                .mutation_cache()
                .build(options, Some(dehydrated.state));
        }

        for dehydrated in state.queries {
            hydrate_query(client, dehydrated);
        }
    });
}

fn hydrate_query(client: &QueryClient, dehydrated: DehydratedQuery) {
    if let Some(query) = client.query_cache().get(&dehydrated.query_hash) {
        let current = query.state();
        if current.data_updated_at < dehydrated.state.data_updated_at {
            query.set_state(QueryState {
                fetch_status: current.fetch_status,
                ..dehydrated.state
            });
        }
        return;
    }

    let mut options = QueryObserverOptions::new(dehydrated.query_key);
    options.query.query_hash = Some(dehydrated.query_hash);
    options.query.meta = dehydrated.meta;
    let options = client.default_query_options(options);
    client.query_cache().build(
        options.query,
        Some(QueryState {
            fetch_status: FetchStatus::Idle,
            ..dehydrated.state
        }),
    );
}
