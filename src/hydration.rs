//! Snapshot and merge boundary for cache state.
//!
//! Dehydration captures settled queries and paused mutations into plain
//! structs; hydration merges them into an existing cache. Paused mutations
//! come back as pending-and-paused entries whose mutation function is
//! resolved from the new client's mutation-key defaults, so
//! `resume_paused_mutations` can run them.

use std::sync::Arc;

use crate::client::QueryClient;
use crate::key::QueryKey;
use crate::mutation::{Mutation, MutationState};
use crate::options::{MutationOptions, QueryMeta, QueryOptions};
use crate::query::{Query, QueryState};

#[derive(Clone, Debug)]
pub struct DehydratedQuery {
    pub query_hash: String,
    pub query_key: QueryKey,
    pub state: QueryState,
}

#[derive(Clone, Debug)]
pub struct DehydratedMutation {
    pub mutation_key: Option<QueryKey>,
    pub scope_id: Option<String>,
    pub meta: Option<QueryMeta>,
    pub state: MutationState,
}

#[derive(Clone, Debug, Default)]
pub struct DehydratedState {
    pub queries: Vec<DehydratedQuery>,
    pub mutations: Vec<DehydratedMutation>,
}

/// Predicates selecting what a snapshot includes. The defaults capture
/// successful queries and paused mutations.
#[derive(Clone, Default)]
pub struct DehydrateOptions {
    pub should_dehydrate_query: Option<Arc<dyn Fn(&Arc<Query>) -> bool + Send + Sync>>,
    pub should_dehydrate_mutation: Option<Arc<dyn Fn(&Arc<Mutation>) -> bool + Send + Sync>>,
}

/// Captures a snapshot of the client's caches.
#[must_use]
pub fn dehydrate(client: &QueryClient, options: &DehydrateOptions) -> DehydratedState {
    let queries = client
        .query_cache()
        .get_all()
        .into_iter()
        .filter(|query| match &options.should_dehydrate_query {
            Some(predicate) => predicate(query),
            None => query.state().status == crate::query::QueryStatus::Success,
        })
        .map(|query| DehydratedQuery {
            query_hash: query.query_hash().to_string(),
            query_key: query.query_key().clone(),
            state: query.state(),
        })
        .collect();

    let mutations = client
        .mutation_cache()
        .get_all()
        .into_iter()
        .filter(|mutation| match &options.should_dehydrate_mutation {
            Some(predicate) => predicate(mutation),
            None => mutation.state().is_paused,
        })
        .map(|mutation| {
            let mutation_options = mutation.options();
            DehydratedMutation {
                mutation_key: mutation_options.mutation_key.clone(),
                scope_id: mutation.scope_id(),
                meta: mutation_options.meta.clone(),
                state: mutation.state(),
            }
        })
        .collect();

    DehydratedState { queries, mutations }
}

/// Merges a snapshot into the client's caches. For queries that already
/// exist, the snapshot only wins when its data is newer.
pub fn hydrate(client: &QueryClient, state: DehydratedState) {
    let query_cache = client.query_cache();
    for dehydrated in state.queries {
        if let Some(existing) = query_cache.get(&dehydrated.query_hash) {
            if dehydrated.state.data_updated_at > existing.state().data_updated_at {
                existing.set_state(dehydrated.state);
            }
            continue;
        }

        let options = client.default_query_options(QueryOptions::new(dehydrated.query_key));
        let _ = query_cache.build(
            client.online_manager(),
            options,
            Some(dehydrated.state),
        );
    }

    let mutation_cache = client.mutation_cache();
    for dehydrated in state.mutations {
        let mut options = MutationOptions::new();
        options.mutation_key = dehydrated.mutation_key;
        options.meta = dehydrated.meta;
        if let Some(id) = dehydrated.scope_id {
            options = options.scope(id);
        }
        let options = client.default_mutation_options(options);
        mutation_cache.build(client.online_manager(), options, Some(dehydrated.state));
    }
}
