//! # Streamable Entities
//!
//! Row snapshots for every entity type a client can subscribe to, with the
//! per-type subscription specs that select them.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::messages::{KnownKeySet, SubscriptionSpecSet};
use super::publisher_set::PublisherSet;
use super::queries::{EntityQueries, QuerySet};
use super::scopes::ScopeId;
use crate::stream::{filter_fn, Filter, Msg, Publisher};

/// Every streamable type, in startup order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Projects,
    Experiments,
    Trials,
    Checkpoints,
    Metrics,
}

impl EntityKind {
    /// All kinds
    pub const ALL: [EntityKind; 5] = [
        EntityKind::Projects,
        EntityKind::Experiments,
        EntityKind::Trials,
        EntityKind::Checkpoints,
        EntityKind::Metrics,
    ];

    /// Plural name used in `known` and `subscribe`
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Projects => "projects",
            EntityKind::Experiments => "experiments",
            EntityKind::Trials => "trials",
            EntityKind::Checkpoints => "checkpoints",
            EntityKind::Metrics => "metrics",
        }
    }

    /// Change-notification channel for this type
    pub fn channel(&self) -> &'static str {
        match self {
            EntityKind::Projects => "stream_project_chan",
            EntityKind::Experiments => "stream_experiment_chan",
            EntityKind::Trials => "stream_trial_chan",
            EntityKind::Checkpoints => "stream_checkpoint_chan",
            EntityKind::Metrics => "stream_metric_chan",
        }
    }

    /// Parse a plural type name
    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-type subscription criteria.
pub trait SubscriptionSpec:
    fmt::Debug + Clone + Default + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// No id criteria at all; `since` does not count
    fn is_empty(&self) -> bool;

    /// Sequence cursor: rows with a larger seq are re-sent on startup
    fn since(&self) -> Option<i64>;
}

/// A type the streaming system can publish.
pub trait Streamable: Msg + fmt::Debug + Clone + DeserializeOwned {
    /// Subscription criteria for this type
    type Spec: SubscriptionSpec;

    /// Which type this is
    const KIND: EntityKind;

    /// Access scope the row belongs to
    fn scope_id(&self) -> ScopeId;

    /// Whether the row satisfies the subscription criteria
    fn matches_spec(&self, spec: &Self::Spec) -> bool;

    /// Spec criteria as a broadcast filter
    fn spec_filter(spec: &Self::Spec) -> Filter<Self> {
        let spec = spec.clone();
        filter_fn(move |msg: &Self| msg.matches_spec(&spec))
    }

    /// This type's publisher
    fn publisher(set: &PublisherSet) -> &Arc<Publisher<Self>>;

    /// This type's queries
    fn queries(set: &QuerySet) -> &Arc<dyn EntityQueries<Self>>;

    /// The client's known keys for this type
    fn known(set: &KnownKeySet) -> &str;

    /// The client's spec for this type, if subscribed
    fn requested(set: &SubscriptionSpecSet) -> Option<&Self::Spec>;
}

// ==================
// Projects
// ==================

/// Project snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectMsg {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub state: String,
    pub workspace_id: ScopeId,
    #[serde(default)]
    pub seq: i64,
}

/// Project subscription: any listed workspace or project
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectSubscriptionSpec {
    pub workspace_ids: Vec<ScopeId>,
    pub project_ids: Vec<i64>,
    pub since: Option<i64>,
}

impl SubscriptionSpec for ProjectSubscriptionSpec {
    fn is_empty(&self) -> bool {
        self.workspace_ids.is_empty() && self.project_ids.is_empty()
    }

    fn since(&self) -> Option<i64> {
        self.since
    }
}

impl Msg for ProjectMsg {
    const UPSERT_KEY: &'static str = "project";
    const DELETE_KEY: &'static str = "projects_deleted";

    fn id(&self) -> i64 {
        self.id
    }

    fn seq_num(&self) -> i64 {
        self.seq
    }
}

impl Streamable for ProjectMsg {
    type Spec = ProjectSubscriptionSpec;
    const KIND: EntityKind = EntityKind::Projects;

    fn scope_id(&self) -> ScopeId {
        self.workspace_id
    }

    fn matches_spec(&self, spec: &Self::Spec) -> bool {
        spec.project_ids.contains(&self.id) || spec.workspace_ids.contains(&self.workspace_id)
    }

    fn publisher(set: &PublisherSet) -> &Arc<Publisher<Self>> {
        &set.projects
    }

    fn queries(set: &QuerySet) -> &Arc<dyn EntityQueries<Self>> {
        &set.projects
    }

    fn known(set: &KnownKeySet) -> &str {
        &set.projects
    }

    fn requested(set: &SubscriptionSpecSet) -> Option<&Self::Spec> {
        set.projects.as_ref()
    }
}

// ==================
// Experiments
// ==================

/// Experiment snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentMsg {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub archived: bool,
    pub project_id: i64,
    pub workspace_id: ScopeId,
    #[serde(default)]
    pub seq: i64,
}

/// Experiment subscription: any listed experiment or project
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentSubscriptionSpec {
    pub experiment_ids: Vec<i64>,
    pub project_ids: Vec<i64>,
    pub since: Option<i64>,
}

impl SubscriptionSpec for ExperimentSubscriptionSpec {
    fn is_empty(&self) -> bool {
        self.experiment_ids.is_empty() && self.project_ids.is_empty()
    }

    fn since(&self) -> Option<i64> {
        self.since
    }
}

impl Msg for ExperimentMsg {
    const UPSERT_KEY: &'static str = "experiment";
    const DELETE_KEY: &'static str = "experiments_deleted";

    fn id(&self) -> i64 {
        self.id
    }

    fn seq_num(&self) -> i64 {
        self.seq
    }
}

impl Streamable for ExperimentMsg {
    type Spec = ExperimentSubscriptionSpec;
    const KIND: EntityKind = EntityKind::Experiments;

    fn scope_id(&self) -> ScopeId {
        self.workspace_id
    }

    fn matches_spec(&self, spec: &Self::Spec) -> bool {
        spec.experiment_ids.contains(&self.id) || spec.project_ids.contains(&self.project_id)
    }

    fn publisher(set: &PublisherSet) -> &Arc<Publisher<Self>> {
        &set.experiments
    }

    fn queries(set: &QuerySet) -> &Arc<dyn EntityQueries<Self>> {
        &set.experiments
    }

    fn known(set: &KnownKeySet) -> &str {
        &set.experiments
    }

    fn requested(set: &SubscriptionSpecSet) -> Option<&Self::Spec> {
        set.experiments.as_ref()
    }
}

// ==================
// Trials
// ==================

/// Trial snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialMsg {
    pub id: i64,
    pub experiment_id: i64,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub total_batches: i64,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    pub workspace_id: ScopeId,
    #[serde(default)]
    pub seq: i64,
}

/// Trial subscription: any listed trial or experiment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrialSubscriptionSpec {
    pub trial_ids: Vec<i64>,
    pub experiment_ids: Vec<i64>,
    pub since: Option<i64>,
}

impl SubscriptionSpec for TrialSubscriptionSpec {
    fn is_empty(&self) -> bool {
        self.trial_ids.is_empty() && self.experiment_ids.is_empty()
    }

    fn since(&self) -> Option<i64> {
        self.since
    }
}

impl Msg for TrialMsg {
    const UPSERT_KEY: &'static str = "trial";
    const DELETE_KEY: &'static str = "trials_deleted";

    fn id(&self) -> i64 {
        self.id
    }

    fn seq_num(&self) -> i64 {
        self.seq
    }
}

impl Streamable for TrialMsg {
    type Spec = TrialSubscriptionSpec;
    const KIND: EntityKind = EntityKind::Trials;

    fn scope_id(&self) -> ScopeId {
        self.workspace_id
    }

    fn matches_spec(&self, spec: &Self::Spec) -> bool {
        spec.trial_ids.contains(&self.id) || spec.experiment_ids.contains(&self.experiment_id)
    }

    fn publisher(set: &PublisherSet) -> &Arc<Publisher<Self>> {
        &set.trials
    }

    fn queries(set: &QuerySet) -> &Arc<dyn EntityQueries<Self>> {
        &set.trials
    }

    fn known(set: &KnownKeySet) -> &str {
        &set.trials
    }

    fn requested(set: &SubscriptionSpecSet) -> Option<&Self::Spec> {
        set.trials.as_ref()
    }
}

// ==================
// Checkpoints
// ==================

/// Checkpoint snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMsg {
    pub id: i64,
    #[serde(default = "Uuid::new_v4")]
    pub uuid: Uuid,
    pub trial_id: i64,
    pub experiment_id: i64,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub report_time: Option<DateTime<Utc>>,
    pub workspace_id: ScopeId,
    #[serde(default)]
    pub seq: i64,
}

/// Checkpoint subscription: any listed checkpoint, trial, or experiment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointSubscriptionSpec {
    pub checkpoint_ids: Vec<i64>,
    pub trial_ids: Vec<i64>,
    pub experiment_ids: Vec<i64>,
    pub since: Option<i64>,
}

impl SubscriptionSpec for CheckpointSubscriptionSpec {
    fn is_empty(&self) -> bool {
        self.checkpoint_ids.is_empty() && self.trial_ids.is_empty() && self.experiment_ids.is_empty()
    }

    fn since(&self) -> Option<i64> {
        self.since
    }
}

impl Msg for CheckpointMsg {
    const UPSERT_KEY: &'static str = "checkpoint";
    const DELETE_KEY: &'static str = "checkpoints_deleted";

    fn id(&self) -> i64 {
        self.id
    }

    fn seq_num(&self) -> i64 {
        self.seq
    }
}

impl Streamable for CheckpointMsg {
    type Spec = CheckpointSubscriptionSpec;
    const KIND: EntityKind = EntityKind::Checkpoints;

    fn scope_id(&self) -> ScopeId {
        self.workspace_id
    }

    fn matches_spec(&self, spec: &Self::Spec) -> bool {
        spec.checkpoint_ids.contains(&self.id)
            || spec.trial_ids.contains(&self.trial_id)
            || spec.experiment_ids.contains(&self.experiment_id)
    }

    fn publisher(set: &PublisherSet) -> &Arc<Publisher<Self>> {
        &set.checkpoints
    }

    fn queries(set: &QuerySet) -> &Arc<dyn EntityQueries<Self>> {
        &set.checkpoints
    }

    fn known(set: &KnownKeySet) -> &str {
        &set.checkpoints
    }

    fn requested(set: &SubscriptionSpecSet) -> Option<&Self::Spec> {
        set.checkpoints.as_ref()
    }
}

// ==================
// Metrics
// ==================

/// One reported batch of trial metrics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricMsg {
    pub id: i64,
    pub trial_id: i64,
    pub experiment_id: i64,
    #[serde(default)]
    pub trial_run_id: i64,
    /// "training", "validation", or a custom group
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub total_batches: i64,
    #[serde(default)]
    pub metrics: Value,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub archived: bool,
    pub workspace_id: ScopeId,
    #[serde(default)]
    pub seq: i64,
}

/// Metric subscription: metrics of any listed trial or experiment
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricSubscriptionSpec {
    pub trial_ids: Vec<i64>,
    pub experiment_ids: Vec<i64>,
    pub since: Option<i64>,
}

impl SubscriptionSpec for MetricSubscriptionSpec {
    fn is_empty(&self) -> bool {
        self.trial_ids.is_empty() && self.experiment_ids.is_empty()
    }

    fn since(&self) -> Option<i64> {
        self.since
    }
}

impl Msg for MetricMsg {
    const UPSERT_KEY: &'static str = "metric";
    const DELETE_KEY: &'static str = "metrics_deleted";

    fn id(&self) -> i64 {
        self.id
    }

    fn seq_num(&self) -> i64 {
        self.seq
    }
}

impl Streamable for MetricMsg {
    type Spec = MetricSubscriptionSpec;
    const KIND: EntityKind = EntityKind::Metrics;

    fn scope_id(&self) -> ScopeId {
        self.workspace_id
    }

    fn matches_spec(&self, spec: &Self::Spec) -> bool {
        spec.trial_ids.contains(&self.trial_id) || spec.experiment_ids.contains(&self.experiment_id)
    }

    fn publisher(set: &PublisherSet) -> &Arc<Publisher<Self>> {
        &set.metrics
    }

    fn queries(set: &QuerySet) -> &Arc<dyn EntityQueries<Self>> {
        &set.metrics
    }

    fn known(set: &KnownKeySet) -> &str {
        &set.metrics
    }

    fn requested(set: &SubscriptionSpecSet) -> Option<&Self::Spec> {
        set.metrics.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trial(id: i64, experiment_id: i64) -> TrialMsg {
        TrialMsg {
            id,
            experiment_id,
            state: "ACTIVE".to_string(),
            total_batches: 0,
            start_time: None,
            end_time: None,
            workspace_id: 1,
            seq: 1,
        }
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(EntityKind::Trials.as_str(), "trials");
        assert_eq!(EntityKind::Trials.channel(), "stream_trial_chan");
        assert_eq!(EntityKind::parse("checkpoints"), Some(EntityKind::Checkpoints));
        assert_eq!(EntityKind::parse("metrics"), Some(EntityKind::Metrics));
        assert_eq!(EntityKind::Metrics.channel(), "stream_metric_chan");
        assert_eq!(EntityKind::parse("widgets"), None);
    }

    #[test]
    fn test_trial_spec_filter() {
        let spec = TrialSubscriptionSpec {
            trial_ids: vec![7],
            experiment_ids: vec![1],
            since: None,
        };
        let filter = TrialMsg::spec_filter(&spec);
        assert!(filter(&trial(1, 1)));
        assert!(filter(&trial(7, 2)));
        assert!(!filter(&trial(8, 2)));
    }

    #[test]
    fn test_metric_spec_filter() {
        let metric: MetricMsg = serde_json::from_value(serde_json::json!({
            "id": 4,
            "trial_id": 7,
            "experiment_id": 2,
            "group": "validation",
            "metrics": {"loss": 0.25},
            "workspace_id": 1,
        }))
        .unwrap();
        assert_eq!(metric.metrics["loss"], 0.25);

        let by_trial = MetricMsg::spec_filter(&MetricSubscriptionSpec {
            trial_ids: vec![7],
            ..Default::default()
        });
        assert!(by_trial(&metric));
        let by_experiment = MetricMsg::spec_filter(&MetricSubscriptionSpec {
            experiment_ids: vec![3],
            ..Default::default()
        });
        assert!(!by_experiment(&metric));
        assert_eq!(MetricMsg::DELETE_KEY, "metrics_deleted");
    }

    #[test]
    fn test_empty_spec_ignores_since() {
        let spec = TrialSubscriptionSpec {
            since: Some(10),
            ..Default::default()
        };
        assert!(spec.is_empty());
        assert!(!CheckpointSubscriptionSpec {
            trial_ids: vec![1],
            ..Default::default()
        }
        .is_empty());
    }

    #[test]
    fn test_upsert_keys() {
        assert_eq!(ProjectMsg::UPSERT_KEY, "project");
        assert_eq!(ExperimentMsg::DELETE_KEY, "experiments_deleted");
        assert_eq!(CheckpointMsg::DELETE_KEY, "checkpoints_deleted");
    }

    #[test]
    fn test_spec_parse_defaults() {
        let spec: TrialSubscriptionSpec =
            serde_json::from_str(r#"{"experiment_ids": [1]}"#).unwrap();
        assert_eq!(spec.experiment_ids, vec![1]);
        assert!(spec.trial_ids.is_empty());
        assert_eq!(spec.since, None);
    }
}
