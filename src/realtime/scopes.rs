//! # Access Scopes
//!
//! Which owning scopes (workspaces) a user may stream from, per entity type.
//!
//! Three strategies are supported:
//! - **Basic**: every user sees every scope; no permission changes to watch
//! - **Rbac**: admins see everything, other users see assigned scopes only
//! - **Permissive**: RBAC is evaluated and logged but never restricts

use std::collections::{BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::entities::{EntityKind, Streamable};
use crate::stream::{filter_fn, Filter, StreamResult};

/// Owning-scope identifier (a workspace id)
pub type ScopeId = i32;

/// Reserved scope id meaning "every scope"
pub const GLOBAL_SCOPE: ScopeId = 0;

/// Notification channel announcing role or assignment changes
pub const PERMISSION_CHANNEL: &str = "stream_permission_chan";

/// Authenticated user of a streaming connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: i32,
    pub username: String,
    #[serde(default)]
    pub admin: bool,
}

/// Scopes a user may stream from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessScopes {
    /// Every scope, including ones created later
    Unrestricted,
    /// Only these scopes
    Only(BTreeSet<ScopeId>),
}

impl AccessScopes {
    /// Build from a scope list; the global scope widens it to everything
    pub fn from_scopes(scopes: impl IntoIterator<Item = ScopeId>) -> Self {
        let scopes: BTreeSet<ScopeId> = scopes.into_iter().collect();
        if scopes.contains(&GLOBAL_SCOPE) {
            AccessScopes::Unrestricted
        } else {
            AccessScopes::Only(scopes)
        }
    }

    /// Whether a row owned by `scope` is visible
    pub fn allows(&self, scope: ScopeId) -> bool {
        match self {
            AccessScopes::Unrestricted => true,
            AccessScopes::Only(scopes) => scopes.contains(&scope),
        }
    }

    /// Scope check as a broadcast filter
    pub fn permission_filter<T: Streamable>(&self) -> Filter<T> {
        match self {
            AccessScopes::Unrestricted => filter_fn(|_: &T| true),
            AccessScopes::Only(scopes) => {
                let scopes = scopes.clone();
                filter_fn(move |msg: &T| scopes.contains(&msg.scope_id()))
            }
        }
    }
}

/// Authorization mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthzMode {
    #[default]
    Basic,
    Rbac,
    Permissive,
}

/// Role assignments: which scopes each non-admin user may see.
#[derive(Debug, Default)]
pub struct RoleAssignments {
    assignments: RwLock<HashMap<i32, BTreeSet<ScopeId>>>,
}

impl RoleAssignments {
    /// Create from initial assignments
    pub fn new(initial: impl IntoIterator<Item = (i32, Vec<ScopeId>)>) -> Self {
        let mut map: HashMap<i32, BTreeSet<ScopeId>> = HashMap::new();
        for (user_id, scopes) in initial {
            map.entry(user_id).or_default().extend(scopes);
        }
        Self {
            assignments: RwLock::new(map),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<i32, BTreeSet<ScopeId>>> {
        self.assignments
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<i32, BTreeSet<ScopeId>>> {
        self.assignments
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Grant a scope. Returns false if the user already had it.
    pub fn assign(&self, user_id: i32, scope: ScopeId) -> bool {
        self.write().entry(user_id).or_default().insert(scope)
    }

    /// Revoke a scope. Returns false if the user did not have it.
    pub fn revoke(&self, user_id: i32, scope: ScopeId) -> bool {
        let mut assignments = self.write();
        match assignments.get_mut(&user_id) {
            Some(scopes) => scopes.remove(&scope),
            None => false,
        }
    }

    /// Scopes assigned to a user
    pub fn scopes_for(&self, user_id: i32) -> BTreeSet<ScopeId> {
        self.read().get(&user_id).cloned().unwrap_or_default()
    }
}

/// Authorization strategy used to compute streamable scopes.
#[derive(Debug)]
pub enum AuthzStrategy {
    Basic,
    Rbac(RoleAssignments),
    Permissive(RoleAssignments),
}

impl AuthzStrategy {
    /// Build a strategy for `mode`
    pub fn new(mode: AuthzMode, assignments: RoleAssignments) -> Self {
        match mode {
            AuthzMode::Basic => AuthzStrategy::Basic,
            AuthzMode::Rbac => AuthzStrategy::Rbac(assignments),
            AuthzMode::Permissive => AuthzStrategy::Permissive(assignments),
        }
    }

    /// Configured mode
    pub fn mode(&self) -> AuthzMode {
        match self {
            AuthzStrategy::Basic => AuthzMode::Basic,
            AuthzStrategy::Rbac(_) => AuthzMode::Rbac,
            AuthzStrategy::Permissive(_) => AuthzMode::Permissive,
        }
    }

    /// Role assignments, if the strategy has any
    pub fn assignments(&self) -> Option<&RoleAssignments> {
        match self {
            AuthzStrategy::Basic => None,
            AuthzStrategy::Rbac(assignments) | AuthzStrategy::Permissive(assignments) => {
                Some(assignments)
            }
        }
    }

    /// Channel that announces permission changes, if this strategy has one
    pub fn permission_channel(&self) -> Option<&'static str> {
        match self {
            AuthzStrategy::Rbac(_) => Some(PERMISSION_CHANNEL),
            AuthzStrategy::Basic | AuthzStrategy::Permissive(_) => None,
        }
    }

    /// Scopes `user` may stream `kind` from
    pub async fn streamable_scopes(
        &self,
        user: &User,
        kind: EntityKind,
    ) -> StreamResult<AccessScopes> {
        match self {
            AuthzStrategy::Basic => Ok(AccessScopes::Unrestricted),
            AuthzStrategy::Rbac(assignments) => Ok(rbac_scopes(assignments, user)),
            AuthzStrategy::Permissive(assignments) => {
                let scopes = rbac_scopes(assignments, user);
                if scopes != AccessScopes::Unrestricted {
                    debug!(
                        user = %user.username,
                        kind = %kind,
                        scopes = ?scopes,
                        "permissive authz: rbac would restrict stream"
                    );
                }
                Ok(AccessScopes::Unrestricted)
            }
        }
    }
}

fn rbac_scopes(assignments: &RoleAssignments, user: &User) -> AccessScopes {
    if user.admin {
        return AccessScopes::Unrestricted;
    }
    AccessScopes::from_scopes(assignments.scopes_for(user.id))
}
