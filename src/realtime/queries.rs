//! Startup queries against the backing store.

use std::sync::Arc;

use async_trait::async_trait;

use super::entities::{
    CheckpointMsg, ExperimentMsg, MetricMsg, ProjectMsg, Streamable, TrialMsg,
};
use super::scopes::AccessScopes;
use crate::stream::StreamResult;

/// Per-type queries run while a subscription starts up.
#[async_trait]
pub trait EntityQueries<T: Streamable>: Send + Sync {
    /// Ascending ids of rows that match `spec` and are visible under `scopes`
    async fn existing_ids(&self, spec: &T::Spec, scopes: &AccessScopes) -> StreamResult<Vec<i64>>;

    /// Full rows matching `spec` and visible under `scopes` whose id is in
    /// `ids` or whose seq is greater than `since`, ascending by id
    async fn hydrate(
        &self,
        spec: &T::Spec,
        ids: &[i64],
        since: Option<i64>,
        scopes: &AccessScopes,
    ) -> StreamResult<Vec<T>>;
}

/// Queries for every streamable type
#[derive(Clone)]
pub struct QuerySet {
    pub projects: Arc<dyn EntityQueries<ProjectMsg>>,
    pub experiments: Arc<dyn EntityQueries<ExperimentMsg>>,
    pub trials: Arc<dyn EntityQueries<TrialMsg>>,
    pub checkpoints: Arc<dyn EntityQueries<CheckpointMsg>>,
    pub metrics: Arc<dyn EntityQueries<MetricMsg>>,
}

impl std::fmt::Debug for QuerySet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QuerySet").finish_non_exhaustive()
    }
}
