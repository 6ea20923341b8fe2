//! # Real-Time Streaming
//!
//! Application layer of the streaming service: the streamable entity types,
//! the client protocol, and the machinery that keeps connections fed.
//!
//! ## Architecture
//!
//! - **Listeners**: change notifications per type, decoded and broadcast
//! - **Publisher set**: all publishers plus their listener loops, all-or-nothing
//! - **Subscription set**: one connection's subscriptions and startup sync
//! - **Connection**: per-socket state machine with soft reset
//! - **Supervisor**: restarts the publisher set and boots connections on
//!   permission changes

pub mod connection;
pub mod entities;
pub mod listener;
pub mod loopback;
pub mod messages;
pub mod publisher_set;
pub mod queries;
pub mod scopes;
pub mod subscription_set;
pub mod supervisor;

pub use connection::{Connection, ConnectionState, SocketReader, SocketWriter};
pub use entities::{
    CheckpointMsg, CheckpointSubscriptionSpec, EntityKind, ExperimentMsg,
    ExperimentSubscriptionSpec, MetricMsg, MetricSubscriptionSpec, ProjectMsg,
    ProjectSubscriptionSpec, Streamable, SubscriptionSpec, TrialMsg, TrialSubscriptionSpec,
};
pub use listener::{ChangeListener, ChangeSource};
pub use messages::{KnownKeySet, StartupMsg, SubscriptionSpecSet, SyncMsg};
pub use publisher_set::PublisherSet;
pub use queries::{EntityQueries, QuerySet};
pub use scopes::{AccessScopes, AuthzMode, AuthzStrategy, RoleAssignments, ScopeId, User};
pub use subscription_set::SubscriptionSet;
pub use supervisor::{Supervisor, SupervisorConfig};
