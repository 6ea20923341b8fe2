//! # Subscription Set
//!
//! A connection's subscriptions, one per requested type, and the startup
//! sequence that brings the client's cache up to date.
//!
//! ## Startup
//! Each subscription registers with its publisher before scanning the
//! database. Any change that lands during the scan is therefore either in
//! the scan, in the queue, or both; the client keeps the copy with the
//! larger seq.

use std::sync::Arc;

use tracing::debug;

use super::entities::{
    CheckpointMsg, ExperimentMsg, MetricMsg, ProjectMsg, Streamable, SubscriptionSpec, TrialMsg,
};
use super::messages::{KnownKeySet, SubscriptionSpecSet};
use super::publisher_set::PublisherSet;
use super::queries::QuerySet;
use super::scopes::{AccessScopes, AuthzStrategy, User};
use crate::stream::{keyset, Outbox, PreparedMessage, StreamResult, Subscription};

/// One type's subscription with the criteria it was built from.
#[derive(Debug)]
struct TypedSubscription<T: Streamable> {
    subscription: Subscription<T>,
    spec: T::Spec,
    scopes: AccessScopes,
}

impl<T: Streamable> TypedSubscription<T> {
    async fn build(
        outbox: &Arc<dyn Outbox>,
        publishers: &PublisherSet,
        authz: &AuthzStrategy,
        user: &User,
        specs: &SubscriptionSpecSet,
    ) -> StreamResult<Option<Self>> {
        let Some(spec) = T::requested(specs) else {
            return Ok(None);
        };
        let scopes = authz.streamable_scopes(user, T::KIND).await?;
        let subscription = Subscription::new(
            Arc::clone(outbox),
            Arc::clone(T::publisher(publishers)),
            scopes.permission_filter::<T>(),
            T::spec_filter(spec),
        );
        Ok(Some(Self {
            subscription,
            spec: spec.clone(),
            scopes,
        }))
    }

    /// Register, then compute the frames that reconcile `known` with the
    /// database: one deletion frame followed by an upsert per row.
    ///
    /// An empty spec stays unregistered and deletes everything known.
    async fn startup(&mut self, queries: &QuerySet, known: &str) -> StreamResult<Vec<PreparedMessage>> {
        if self.spec.is_empty() {
            self.subscription.unregister();
            let removed = keyset::normalize(known)?;
            return Ok(vec![PreparedMessage::deleted(T::DELETE_KEY, &removed)]);
        }
        self.subscription.register();

        let queries = T::queries(queries);
        let exists = queries.existing_ids(&self.spec, &self.scopes).await?;
        let reconciled = keyset::reconcile(known, &exists)?;

        let since = self.spec.since();
        let rows = if reconciled.appeared.is_empty() && since.is_none() {
            Vec::new()
        } else {
            queries
                .hydrate(&self.spec, &reconciled.appeared, since, &self.scopes)
                .await?
        };

        debug!(
            kind = %T::KIND,
            existing = exists.len(),
            removed = %reconciled.removed,
            hydrated = rows.len(),
            "subscription startup"
        );

        let mut msgs = Vec::with_capacity(rows.len() + 1);
        msgs.push(PreparedMessage::deleted(T::DELETE_KEY, &reconciled.removed));
        for row in &rows {
            msgs.push(PreparedMessage::upsert(row)?);
        }
        Ok(msgs)
    }
}

/// Every subscription of one connection.
#[derive(Debug)]
pub struct SubscriptionSet {
    projects: Option<TypedSubscription<ProjectMsg>>,
    experiments: Option<TypedSubscription<ExperimentMsg>>,
    trials: Option<TypedSubscription<TrialMsg>>,
    checkpoints: Option<TypedSubscription<CheckpointMsg>>,
    metrics: Option<TypedSubscription<MetricMsg>>,
}

impl SubscriptionSet {
    /// Build unregistered subscriptions for every type in `specs`, with
    /// permission filters computed for `user` right now.
    pub async fn new(
        outbox: Arc<dyn Outbox>,
        publishers: &PublisherSet,
        authz: &AuthzStrategy,
        user: &User,
        specs: &SubscriptionSpecSet,
    ) -> StreamResult<Self> {
        Ok(Self {
            projects: TypedSubscription::build(&outbox, publishers, authz, user, specs).await?,
            experiments: TypedSubscription::build(&outbox, publishers, authz, user, specs).await?,
            trials: TypedSubscription::build(&outbox, publishers, authz, user, specs).await?,
            checkpoints: TypedSubscription::build(&outbox, publishers, authz, user, specs).await?,
            metrics: TypedSubscription::build(&outbox, publishers, authz, user, specs).await?,
        })
    }

    /// Register every subscription and return the startup frames, grouped
    /// by type: projects, experiments, trials, checkpoints, metrics.
    pub async fn startup(
        &mut self,
        queries: &QuerySet,
        known: &KnownKeySet,
    ) -> StreamResult<Vec<PreparedMessage>> {
        let mut msgs = Vec::new();
        if let Some(sub) = self.projects.as_mut() {
            msgs.extend(sub.startup(queries, ProjectMsg::known(known)).await?);
        }
        if let Some(sub) = self.experiments.as_mut() {
            msgs.extend(sub.startup(queries, ExperimentMsg::known(known)).await?);
        }
        if let Some(sub) = self.trials.as_mut() {
            msgs.extend(sub.startup(queries, TrialMsg::known(known)).await?);
        }
        if let Some(sub) = self.checkpoints.as_mut() {
            msgs.extend(sub.startup(queries, CheckpointMsg::known(known)).await?);
        }
        if let Some(sub) = self.metrics.as_mut() {
            msgs.extend(sub.startup(queries, MetricMsg::known(known)).await?);
        }
        Ok(msgs)
    }

    /// Detach every subscription from its publisher
    pub fn unregister_all(&mut self) {
        if let Some(sub) = self.projects.as_mut() {
            sub.subscription.unregister();
        }
        if let Some(sub) = self.experiments.as_mut() {
            sub.subscription.unregister();
        }
        if let Some(sub) = self.trials.as_mut() {
            sub.subscription.unregister();
        }
        if let Some(sub) = self.checkpoints.as_mut() {
            sub.subscription.unregister();
        }
        if let Some(sub) = self.metrics.as_mut() {
            sub.subscription.unregister();
        }
    }

    /// Number of subscriptions attached to a publisher
    pub fn registered_count(&self) -> usize {
        [
            self.projects.as_ref().map(|s| s.subscription.is_registered()),
            self.experiments.as_ref().map(|s| s.subscription.is_registered()),
            self.trials.as_ref().map(|s| s.subscription.is_registered()),
            self.checkpoints.as_ref().map(|s| s.subscription.is_registered()),
            self.metrics.as_ref().map(|s| s.subscription.is_registered()),
        ]
        .into_iter()
        .filter(|registered| *registered == Some(true))
        .count()
    }
}
