//! # Configuration
//!
//! JSON configuration file. Every field has a default, so an empty object
//! is a valid configuration.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::http_server::HttpServerConfig;
use crate::realtime::scopes::{AuthzMode, RoleAssignments, ScopeId, User};
use crate::realtime::SupervisorConfig;
use crate::stream::{StreamError, StreamResult};

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Filter directive used when `RUST_LOG` is unset (default: "info")
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Scopes granted to one user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeAssignment {
    pub user_id: i32,
    pub workspace_ids: Vec<ScopeId>,
}

/// Authorization configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthzConfig {
    #[serde(default)]
    pub mode: AuthzMode,

    #[serde(default)]
    pub assignments: Vec<ScopeAssignment>,
}

impl AuthzConfig {
    /// Initial role assignments
    pub fn role_assignments(&self) -> RoleAssignments {
        RoleAssignments::new(
            self.assignments
                .iter()
                .map(|a| (a.user_id, a.workspace_ids.clone())),
        )
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivesyncConfig {
    #[serde(default)]
    pub http: HttpServerConfig,

    /// Seconds between listener keepalive pings (default: 30)
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,

    /// Seconds to wait before restarting a failed publisher set (default: 2)
    #[serde(default = "default_restart_backoff_secs")]
    pub restart_backoff_secs: u64,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub authz: AuthzConfig,

    /// Users allowed to connect; the stream token is the username
    #[serde(default)]
    pub users: Vec<User>,

    /// Optional JSON file seeding the in-memory database
    #[serde(default)]
    pub fixture: Option<PathBuf>,
}

fn default_keepalive_secs() -> u64 {
    30
}

fn default_restart_backoff_secs() -> u64 {
    2
}

impl Default for LivesyncConfig {
    fn default() -> Self {
        Self {
            http: HttpServerConfig::default(),
            keepalive_secs: default_keepalive_secs(),
            restart_backoff_secs: default_restart_backoff_secs(),
            log: LogConfig::default(),
            authz: AuthzConfig::default(),
            users: Vec::new(),
            fixture: None,
        }
    }
}

impl LivesyncConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> StreamResult<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| StreamError::Config(format!("Failed to read config: {}", e)))?;

        let config: LivesyncConfig = serde_json::from_str(&content)
            .map_err(|e| StreamError::Config(format!("Invalid config JSON: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Reject configurations the server cannot run with
    pub fn validate(&self) -> StreamResult<()> {
        if self.keepalive_secs == 0 {
            return Err(StreamError::Config("keepalive_secs must be > 0".to_string()));
        }

        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        for user in &self.users {
            if !ids.insert(user.id) {
                return Err(StreamError::Config(format!("Duplicate user id: {}", user.id)));
            }
            if !names.insert(user.username.as_str()) {
                return Err(StreamError::Config(format!(
                    "Duplicate username: '{}'",
                    user.username
                )));
            }
        }

        for assignment in &self.authz.assignments {
            if !ids.contains(&assignment.user_id) {
                return Err(StreamError::Config(format!(
                    "Assignment for unknown user id: {}",
                    assignment.user_id
                )));
            }
        }

        Ok(())
    }

    /// Supervisor timing
    pub fn supervisor(&self) -> SupervisorConfig {
        SupervisorConfig {
            keepalive: Duration::from_secs(self.keepalive_secs),
            restart_backoff: Duration::from_secs(self.restart_backoff_secs),
        }
    }
}
