//! # HTTP Server
//!
//! Combines the streaming, data, and observability routers into one axum
//! server.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use super::config::HttpServerConfig;
use super::data_routes::data_routes;
use super::observability_routes::observability_routes;
use super::stream_routes::stream_routes;
use crate::config::LivesyncConfig;
use crate::memory::MemoryDatabase;
use crate::realtime::{AuthzStrategy, Supervisor, User};
use crate::stream::{StreamError, StreamResult};

/// State shared by every handler
pub struct AppState {
    pub supervisor: Supervisor,
    pub db: Arc<MemoryDatabase>,
    pub authz: Arc<AuthzStrategy>,
    /// Known users by username; the stream token is the username
    pub users: HashMap<String, User>,
    /// Cancelled on shutdown; every connection token derives from it
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        supervisor: Supervisor,
        db: Arc<MemoryDatabase>,
        authz: Arc<AuthzStrategy>,
        users: impl IntoIterator<Item = User>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            supervisor,
            db,
            authz,
            users: users
                .into_iter()
                .map(|user| (user.username.clone(), user))
                .collect(),
            shutdown,
        }
    }

    /// Wire a supervisor over `db` with the configured authz and users
    pub fn from_config(
        config: &LivesyncConfig,
        db: Arc<MemoryDatabase>,
        shutdown: CancellationToken,
    ) -> Self {
        let authz = Arc::new(AuthzStrategy::new(
            config.authz.mode,
            config.authz.role_assignments(),
        ));
        let supervisor = Supervisor::new(
            db.change_source(),
            db.queries(),
            Arc::clone(&authz),
            config.supervisor(),
        );
        Self::new(supervisor, db, authz, config.users.clone(), shutdown)
    }

    /// Look up the user a stream token names
    pub fn authenticate(&self, token: &str) -> Option<User> {
        self.users.get(token).cloned()
    }
}

/// HTTP server for the streaming service
pub struct HttpServer {
    config: HttpServerConfig,
    router: Router,
    shutdown: CancellationToken,
}

impl HttpServer {
    pub fn new(config: HttpServerConfig, state: Arc<AppState>) -> Self {
        let shutdown = state.shutdown.clone();
        let router = Self::build_router(&config, state);
        Self {
            config,
            router,
            shutdown,
        }
    }

    fn build_router(config: &HttpServerConfig, state: Arc<AppState>) -> Router {
        Router::new()
            .merge(observability_routes(Arc::clone(&state)))
            .merge(stream_routes(Arc::clone(&state)))
            .merge(data_routes(state))
            .layer(TraceLayer::new_for_http())
            .layer(config.cors_layer())
    }

    /// Configured listen address
    pub fn socket_addr(&self) -> StreamResult<SocketAddr> {
        self.config.socket_addr()
    }

    /// The router (for testing)
    pub fn router(self) -> Router {
        self.router
    }

    /// Bind the configured address and serve until shutdown
    pub async fn start(self) -> StreamResult<()> {
        let addr = self.config.socket_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| StreamError::Transport(format!("binding {}: {}", addr, e)))?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> StreamResult<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "streaming server listening");
        }
        axum::serve(listener, self.router)
            .with_graceful_shutdown(self.shutdown.cancelled_owned())
            .await
            .map_err(|e| StreamError::Transport(format!("HTTP server failed: {}", e)))
    }
}
