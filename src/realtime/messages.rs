//! Client control messages.

use serde::{Deserialize, Serialize};

use super::entities::{
    CheckpointSubscriptionSpec, EntityKind, ExperimentSubscriptionSpec, MetricSubscriptionSpec,
    ProjectSubscriptionSpec, TrialSubscriptionSpec,
};
use crate::stream::{PreparedMessage, StreamError, StreamResult};

/// Range-encoded keys the client already holds, per type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KnownKeySet {
    pub projects: String,
    pub experiments: String,
    pub trials: String,
    pub checkpoints: String,
    pub metrics: String,
}

impl KnownKeySet {
    /// Known keys for one type
    pub fn get(&self, kind: EntityKind) -> &str {
        match kind {
            EntityKind::Projects => &self.projects,
            EntityKind::Experiments => &self.experiments,
            EntityKind::Trials => &self.trials,
            EntityKind::Checkpoints => &self.checkpoints,
            EntityKind::Metrics => &self.metrics,
        }
    }
}

/// What the client wants to see, per type. Absent types are not streamed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SubscriptionSpecSet {
    pub projects: Option<ProjectSubscriptionSpec>,
    pub experiments: Option<ExperimentSubscriptionSpec>,
    pub trials: Option<TrialSubscriptionSpec>,
    pub checkpoints: Option<CheckpointSubscriptionSpec>,
    pub metrics: Option<MetricSubscriptionSpec>,
}

impl SubscriptionSpecSet {
    /// Types the client subscribed to
    pub fn kinds(&self) -> Vec<EntityKind> {
        let mut kinds = Vec::new();
        if self.projects.is_some() {
            kinds.push(EntityKind::Projects);
        }
        if self.experiments.is_some() {
            kinds.push(EntityKind::Experiments);
        }
        if self.trials.is_some() {
            kinds.push(EntityKind::Trials);
        }
        if self.checkpoints.is_some() {
            kinds.push(EntityKind::Checkpoints);
        }
        if self.metrics.is_some() {
            kinds.push(EntityKind::Metrics);
        }
        kinds
    }
}

/// Opens or replaces the client's subscriptions.
///
/// The first one starts the stream; every later one triggers a soft reset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StartupMsg {
    #[serde(default)]
    pub sync_id: String,
    #[serde(default)]
    pub known: KnownKeySet,
    #[serde(default)]
    pub subscribe: SubscriptionSpecSet,
}

impl StartupMsg {
    /// Parse a client text frame
    pub fn parse(text: &str) -> StreamResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| StreamError::InvalidMessage(format!("startup message: {}", e)))
    }
}

/// Brackets a startup sync. Clients correlate brackets by `sync_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMsg {
    pub sync_id: String,
    pub complete: bool,
}

impl SyncMsg {
    /// Opening bracket
    pub fn begin(sync_id: &str) -> Self {
        Self {
            sync_id: sync_id.to_string(),
            complete: false,
        }
    }

    /// Closing bracket
    pub fn complete(sync_id: &str) -> Self {
        Self {
            sync_id: sync_id.to_string(),
            complete: true,
        }
    }

    /// Outbound frame
    pub fn prepare(&self) -> PreparedMessage {
        PreparedMessage::sync(&self.sync_id, self.complete)
    }
}
